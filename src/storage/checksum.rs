//! Checksums for redo log frames
//!
//! Every redo entry is framed as `[len: u32][payload][crc32: u32]` so that a
//! torn write at the log tail is detected during recovery and the tail is
//! discarded instead of replayed.

use crc32fast::Hasher;

/// Frame overhead in bytes (length prefix + checksum)
pub const FRAME_OVERHEAD: usize = 8;

pub struct Checksum;

impl Checksum {
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumError> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }
        Ok(())
    }

    /// Append `[len][data][crc]` to `out`
    pub fn encode_frame(data: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&Self::compute(data).to_le_bytes());
    }

    /// Decode the frame at the start of `buf`, returning the payload and the
    /// total number of bytes consumed.
    pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], usize), ChecksumError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(ChecksumError::Truncated {
                needed: FRAME_OVERHEAD,
                available: buf.len(),
            });
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let total = FRAME_OVERHEAD + len;
        if buf.len() < total {
            return Err(ChecksumError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }
        let data = &buf[4..4 + len];
        let crc = u32::from_le_bytes([
            buf[4 + len],
            buf[5 + len],
            buf[6 + len],
            buf[7 + len],
        ]);
        Self::verify(data, crc)?;
        Ok((data, total))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})")]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },

    #[error("Frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}
