//! Redo log
//!
//! Append-only log of physical page operations. Each mini-transaction is
//! written as one checksummed frame, so a crash can only lose whole
//! mini-transactions from the tail, never half of one. Log order equals
//! mini-transaction commit order because frames are appended under the
//! log mutex while the committing mtr still holds its page latches.
//!
//! ## Frame format
//! ```text
//! [len: u32][bincode(MtrLogBlock)][crc32: u32]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::RedoConfig;
use crate::storage::{Checksum, PageNo, PageOp};
use crate::Result;

/// Log sequence number (monotonically increasing, starts at 1)
pub type Lsn = u64;

/// One logged page operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoRecord {
    pub lsn: Lsn,
    pub page_no: PageNo,
    pub op: PageOp,
}

/// All records of one committed mini-transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MtrLogBlock {
    records: Vec<RedoRecord>,
}

struct RedoInner {
    next_lsn: Lsn,
    buf: Vec<u8>,
    file: Option<File>,
    n_mtrs: u64,
}

/// Redo log statistics
#[derive(Debug, Default, Clone)]
pub struct RedoStats {
    pub current_lsn: Lsn,
    pub bytes: usize,
    pub mtrs: u64,
}

pub struct RedoLog {
    inner: Mutex<RedoInner>,
    sync_on_commit: bool,
}

impl RedoLog {
    /// In-memory log
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(RedoInner {
                next_lsn: 1,
                buf: Vec::new(),
                file: None,
                n_mtrs: 0,
            }),
            sync_on_commit: false,
        }
    }

    pub fn new(config: &RedoConfig) -> Result<Self> {
        let file = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .read(true)
                        .open(path)?,
                )
            }
            None => None,
        };
        Ok(Self {
            inner: Mutex::new(RedoInner {
                next_lsn: 1,
                buf: Vec::new(),
                file,
                n_mtrs: 0,
            }),
            sync_on_commit: config.sync_on_commit,
        })
    }

    /// Append the operations of one mini-transaction, returning the LSN
    /// assigned to each operation in order.
    pub fn append_mtr(&self, ops: Vec<(PageNo, PageOp)>) -> Result<Vec<Lsn>> {
        let mut inner = self.inner.lock();
        let first = inner.next_lsn;
        let records: Vec<RedoRecord> = ops
            .into_iter()
            .enumerate()
            .map(|(i, (page_no, op))| RedoRecord {
                lsn: first + i as Lsn,
                page_no,
                op,
            })
            .collect();
        let lsns: Vec<Lsn> = records.iter().map(|r| r.lsn).collect();
        let payload = bincode::serialize(&MtrLogBlock { records })?;

        let mut frame = Vec::with_capacity(payload.len() + 8);
        Checksum::encode_frame(&payload, &mut frame);
        if let Some(file) = inner.file.as_mut() {
            file.write_all(&frame)?;
            if self.sync_on_commit {
                file.sync_data()?;
            }
        }
        inner.buf.extend_from_slice(&frame);
        inner.next_lsn = first + lsns.len() as Lsn;
        inner.n_mtrs += 1;
        Ok(lsns)
    }

    /// LSN the next record will receive
    pub fn current_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Continue numbering after a replayed log
    pub fn advance_to(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        inner.next_lsn = inner.next_lsn.max(lsn);
    }

    /// Decode every record written so far
    pub fn records(&self) -> Result<Vec<RedoRecord>> {
        let inner = self.inner.lock();
        parse_log(&inner.buf)
    }

    /// Decode a log file written by a previous process
    pub fn read_file(path: &Path) -> Result<Vec<RedoRecord>> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        parse_log(&buf)
    }

    pub fn stats(&self) -> RedoStats {
        let inner = self.inner.lock();
        RedoStats {
            current_lsn: inner.next_lsn,
            bytes: inner.buf.len(),
            mtrs: inner.n_mtrs,
        }
    }
}

/// Decode frames until the end of the buffer or the first damaged frame;
/// a damaged frame marks the torn tail of a crash.
pub fn parse_log(buf: &[u8]) -> Result<Vec<RedoRecord>> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        match Checksum::decode_frame(&buf[pos..]) {
            Ok((payload, used)) => {
                let block: MtrLogBlock = bincode::deserialize(payload)?;
                records.extend(block.records);
                pos += used;
            }
            Err(e) => {
                warn!(
                    "redo log: discarding {} tail bytes at offset {}: {}",
                    buf.len() - pos,
                    pos,
                    e
                );
                break;
            }
        }
    }
    debug!("redo log: parsed {} records", records.len());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lsns_follow_commit_order() {
        let log = RedoLog::in_memory();
        let a = log
            .append_mtr(vec![(1, PageOp::SetNext(2)), (2, PageOp::SetPrev(1))])
            .unwrap();
        let b = log.append_mtr(vec![(3, PageOp::Reorganize)]).unwrap();
        assert_eq!(a, vec![1, 2]);
        assert_eq!(b, vec![3]);
        assert_eq!(log.current_lsn(), 4);

        let records = log.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].page_no, 3);
        assert_eq!(log.stats().mtrs, 2);
    }

    #[test]
    fn test_file_log_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redo.log");
        {
            let log = RedoLog::new(&RedoConfig {
                sync_on_commit: true,
                path: Some(path.clone()),
            })
            .unwrap();
            log.append_mtr(vec![(1, PageOp::SetLevel(1))]).unwrap();
            log.append_mtr(vec![(1, PageOp::SetLevel(2))]).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let records = RedoLog::read_file(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op, PageOp::SetLevel(1));
    }
}
