//! Record codec
//!
//! Tuples are ordered lists of byte fields compared field by field with
//! memcmp semantics. On a page a record is encoded as:
//!
//! ```text
//! [info: u8][n_fields: u8][field lengths][field bytes...]
//! ```
//!
//! Redundant format stores every length as a little-endian `u16`. Compact
//! format stores lengths below 128 in one byte and longer ones in two bytes
//! with the high bit of the first byte set. Node pointers carry the child
//! page number as a 4-byte big-endian last field.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::storage::PageNo;
use crate::{Result, StorageError};

/// Record is the leftmost node pointer of its level and compares as -inf
pub const REC_INFO_MIN_REC: u8 = 0x01;

/// Record references externally stored fields
pub const REC_INFO_EXTERN: u8 = 0x02;

/// Maximum number of fields in a record
pub const MAX_FIELDS: usize = 255;

/// Maximum length of a single field
pub const MAX_FIELD_LEN: usize = 0x7fff;

/// Physical row format of every page in an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowFormat {
    Redundant,
    Compact,
}

/// Static description of an index tree's records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDesc {
    pub index_id: u64,
    /// Number of leading fields that identify a record uniquely in the tree
    pub n_uniq: usize,
    /// Number of fields in a leaf record
    pub n_fields: usize,
    pub row_format: RowFormat,
}

impl IndexDesc {
    /// Key-only index: each leaf record is just its key fields
    pub fn new(index_id: u64, n_uniq: usize, n_fields: usize) -> Self {
        Self {
            index_id,
            n_uniq,
            n_fields,
            row_format: RowFormat::Compact,
        }
    }

    pub fn with_row_format(mut self, row_format: RowFormat) -> Self {
        self.row_format = row_format;
        self
    }

    pub fn is_compact(&self) -> bool {
        self.row_format == RowFormat::Compact
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_uniq == 0 || self.n_uniq > self.n_fields || self.n_fields >= MAX_FIELDS {
            return Err(StorageError::InvalidArgument(format!(
                "index {}: n_uniq={} n_fields={}",
                self.index_id, self.n_uniq, self.n_fields
            )));
        }
        Ok(())
    }
}

/// Logical record: owned fields plus info bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub fields: Vec<Vec<u8>>,
    pub info_bits: u8,
    /// Number of leading fields taking part in comparisons
    pub n_fields_cmp: usize,
}

impl Tuple {
    pub fn new(fields: Vec<Vec<u8>>) -> Self {
        let n = fields.len();
        Self {
            fields,
            info_bits: 0,
            n_fields_cmp: n,
        }
    }

    /// Single-field tuple from a u64, encoded big-endian so memcmp order
    /// matches numeric order
    pub fn from_u64(key: u64) -> Self {
        Self::new(vec![key.to_be_bytes().to_vec()])
    }

    /// Key field followed by a payload field
    pub fn with_payload(key: u64, payload: &[u8]) -> Self {
        let mut tuple = Self::new(vec![key.to_be_bytes().to_vec(), payload.to_vec()]);
        tuple.n_fields_cmp = 1;
        tuple
    }

    /// Search tuple made of the first `n` fields
    pub fn prefix(&self, n: usize) -> Self {
        let n = n.min(self.fields.len());
        Self {
            fields: self.fields[..n].to_vec(),
            info_bits: 0,
            n_fields_cmp: n,
        }
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn has_external(&self) -> bool {
        self.info_bits & REC_INFO_EXTERN != 0
    }

    /// Mark the tuple as referencing externally stored fields
    pub fn set_external(&mut self) {
        self.info_bits |= REC_INFO_EXTERN;
    }

    /// First field decoded as a big-endian u64 (test and debug helper)
    pub fn key_u64(&self) -> Option<u64> {
        self.fields.first().and_then(|f| decode_u64(f))
    }

    /// Encode for storage on a page of the given format
    pub fn encode(&self, format: RowFormat) -> Result<Vec<u8>> {
        if self.fields.len() > MAX_FIELDS {
            return Err(StorageError::InvalidArgument(format!(
                "{} fields exceeds {}",
                self.fields.len(),
                MAX_FIELDS
            )));
        }
        let mut buf = Vec::with_capacity(converted_size(self, format));
        buf.push(self.info_bits);
        buf.push(self.fields.len() as u8);
        for field in &self.fields {
            if field.len() > MAX_FIELD_LEN {
                return Err(StorageError::InvalidArgument(format!(
                    "field of {} bytes exceeds {}",
                    field.len(),
                    MAX_FIELD_LEN
                )));
            }
            encode_len(&mut buf, field.len(), format);
        }
        for field in &self.fields {
            buf.extend_from_slice(field);
        }
        Ok(buf)
    }
}

pub fn decode_u64(field: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = field.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn len_width(len: usize, format: RowFormat) -> usize {
    match format {
        RowFormat::Redundant => 2,
        RowFormat::Compact if len < 0x80 => 1,
        RowFormat::Compact => 2,
    }
}

fn encode_len(buf: &mut Vec<u8>, len: usize, format: RowFormat) {
    match format {
        RowFormat::Redundant => buf.extend_from_slice(&(len as u16).to_le_bytes()),
        RowFormat::Compact if len < 0x80 => buf.push(len as u8),
        RowFormat::Compact => {
            buf.push(0x80 | (len >> 8) as u8);
            buf.push((len & 0xff) as u8);
        }
    }
}

/// Size in bytes of the tuple once encoded as a record
pub fn converted_size(tuple: &Tuple, format: RowFormat) -> usize {
    2 + tuple
        .fields
        .iter()
        .map(|f| len_width(f.len(), format) + f.len())
        .sum::<usize>()
}

/// Borrowed view of an encoded record
#[derive(Clone, Copy)]
pub struct RecView<'a> {
    data: &'a [u8],
    format: RowFormat,
}

impl<'a> RecView<'a> {
    /// Parse the record starting at `data[0]`; `data` may extend past it
    pub fn parse(data: &'a [u8], format: RowFormat) -> Result<Self> {
        let size = rec_size(data, format)?;
        Ok(Self {
            data: &data[..size],
            format,
        })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn info_bits(&self) -> u8 {
        self.data[0]
    }

    pub fn is_min_rec(&self) -> bool {
        self.info_bits() & REC_INFO_MIN_REC != 0
    }

    pub fn has_external(&self) -> bool {
        self.info_bits() & REC_INFO_EXTERN != 0
    }

    pub fn n_fields(&self) -> usize {
        self.data[1] as usize
    }

    fn field_bounds(&self) -> impl Iterator<Item = (usize, usize)> + 'a {
        let format = self.format;
        let data = self.data;
        let n = data[1] as usize;
        let mut len_pos = 2;
        let mut data_pos = 2;
        for _ in 0..n {
            data_pos += read_len(data, data_pos, format).1;
        }
        (0..n).map(move |_| {
            let (len, w) = read_len(data, len_pos, format);
            len_pos += w;
            let start = data_pos;
            data_pos += len;
            (start, len)
        })
    }

    pub fn field(&self, i: usize) -> &'a [u8] {
        let data = self.data;
        let (start, len) = self
            .field_bounds()
            .nth(i)
            .unwrap_or((data.len(), 0));
        &data[start..start + len]
    }

    pub fn fields(&self) -> Vec<&'a [u8]> {
        let data = self.data;
        self.field_bounds()
            .map(|(start, len)| &data[start..start + len])
            .collect()
    }

    /// Child page number of a node pointer record
    pub fn child_page_no(&self) -> PageNo {
        let last = self.field(self.n_fields().saturating_sub(1));
        let bytes: [u8; 4] = last.try_into().unwrap_or([0xff; 4]);
        PageNo::from_be_bytes(bytes)
    }

    /// Number of fields that take part in comparisons on a page of `level`
    pub fn n_key_fields(&self, level: u16) -> usize {
        if level == 0 {
            self.n_fields()
        } else {
            self.n_fields().saturating_sub(1)
        }
    }

    /// Owned copy of the record
    pub fn to_tuple(&self) -> Tuple {
        let fields: Vec<Vec<u8>> = self.fields().into_iter().map(<[u8]>::to_vec).collect();
        let mut tuple = Tuple::new(fields);
        tuple.info_bits = self.info_bits();
        tuple
    }

    /// Search tuple built from the first `n` fields
    pub fn copy_prefix(&self, n: usize) -> Tuple {
        let fields: Vec<Vec<u8>> = self
            .fields()
            .into_iter()
            .take(n)
            .map(<[u8]>::to_vec)
            .collect();
        Tuple::new(fields)
    }
}

impl std::fmt::Debug for RecView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields: Vec<String> = self
            .fields()
            .iter()
            .map(|field| match decode_u64(field) {
                Some(v) => v.to_string(),
                None => format!("{:02x?}", field),
            })
            .collect();
        write!(f, "rec(info={:#x}, [{}])", self.info_bits(), fields.join(", "))
    }
}

fn read_len(data: &[u8], pos: usize, format: RowFormat) -> (usize, usize) {
    match format {
        RowFormat::Redundant => (u16::from_le_bytes([data[pos], data[pos + 1]]) as usize, 2),
        RowFormat::Compact => {
            let b = data[pos];
            if b & 0x80 == 0 {
                (b as usize, 1)
            } else {
                ((((b & 0x7f) as usize) << 8) | data[pos + 1] as usize, 2)
            }
        }
    }
}

/// Total encoded size of the record starting at `data[0]`
pub fn rec_size(data: &[u8], format: RowFormat) -> Result<usize> {
    if data.len() < 2 {
        return Err(StorageError::Corruption("record header truncated".into()));
    }
    let n = data[1] as usize;
    let mut pos = 2;
    let mut payload = 0;
    for _ in 0..n {
        if pos >= data.len() || (format == RowFormat::Redundant && pos + 1 >= data.len()) {
            return Err(StorageError::Corruption("record length array truncated".into()));
        }
        let (len, w) = read_len(data, pos, format);
        if format == RowFormat::Compact && w == 2 && pos + 1 >= data.len() {
            return Err(StorageError::Corruption("record length array truncated".into()));
        }
        pos += w;
        payload += len;
    }
    let size = pos + payload;
    if size > data.len() {
        return Err(StorageError::Corruption(format!(
            "record of {} bytes overruns {} available",
            size,
            data.len()
        )));
    }
    Ok(size)
}

/// Compare `tuple` against `rec`, skipping the first `start` fields which
/// the caller already knows to be equal. Returns the order of the tuple
/// relative to the record and the total number of fully matched fields.
pub fn compare_tuple_rec(
    tuple: &Tuple,
    rec: &RecView<'_>,
    n_rec_key_fields: usize,
    start: usize,
) -> (Ordering, usize) {
    let n = tuple.n_fields_cmp.min(n_rec_key_fields);
    let rec_fields = rec.fields();
    let mut matched = start.min(n);
    while matched < n {
        match tuple.fields[matched].as_slice().cmp(rec_fields[matched]) {
            Ordering::Equal => matched += 1,
            ord => return (ord, matched),
        }
    }
    (Ordering::Equal, matched)
}

/// Compare two records of the same page level field by field
pub fn compare_recs(a: &RecView<'_>, b: &RecView<'_>, n_fields: usize) -> Ordering {
    let af = a.fields();
    let bf = b.fields();
    for i in 0..n_fields.min(af.len()).min(bf.len()) {
        match af[i].cmp(bf[i]) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// Node pointer to `child` keyed by the first `n_uniq` fields of `first`
pub fn build_node_pointer(index: &IndexDesc, first: &Tuple, child: PageNo) -> Tuple {
    let mut fields: Vec<Vec<u8>> = first.fields.iter().take(index.n_uniq).cloned().collect();
    fields.push(child.to_be_bytes().to_vec());
    Tuple {
        fields,
        info_bits: 0,
        n_fields_cmp: index.n_uniq,
    }
}

/// Storage for columns kept off-page; the B-tree only frees them
pub trait ExternalFieldStore: Send + Sync {
    /// Release the external storage referenced by `rec`
    fn free_external_fields(&self, rec: &Tuple);
}

/// In-memory store that only counts frees
#[derive(Debug, Default)]
pub struct CountingExternalStore {
    freed: AtomicU64,
}

impl CountingExternalStore {
    pub fn freed(&self) -> u64 {
        self.freed.load(AtomicOrdering::Relaxed)
    }
}

impl ExternalFieldStore for CountingExternalStore {
    fn free_external_fields(&self, _rec: &Tuple) {
        self.freed.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_compact_and_redundant() {
        let long = vec![7u8; 300];
        let tuple = Tuple::new(vec![b"abc".to_vec(), long.clone(), Vec::new()]);
        for format in [RowFormat::Compact, RowFormat::Redundant] {
            let bytes = tuple.encode(format).unwrap();
            assert_eq!(bytes.len(), converted_size(&tuple, format));
            let rec = RecView::parse(&bytes, format).unwrap();
            assert_eq!(rec.n_fields(), 3);
            assert_eq!(rec.field(0), b"abc");
            assert_eq!(rec.field(1), long.as_slice());
            assert!(rec.field(2).is_empty());
        }
        assert!(
            converted_size(&tuple, RowFormat::Compact)
                < converted_size(&tuple, RowFormat::Redundant)
        );
    }

    #[test]
    fn test_compare_counts_matched_fields() {
        let rec_tuple = Tuple::new(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let bytes = rec_tuple.encode(RowFormat::Compact).unwrap();
        let rec = RecView::parse(&bytes, RowFormat::Compact).unwrap();

        let probe = Tuple::new(vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
        assert_eq!(compare_tuple_rec(&probe, &rec, 3, 0), (Ordering::Greater, 2));

        let probe = Tuple::new(vec![b"a".to_vec()]);
        assert_eq!(compare_tuple_rec(&probe, &rec, 3, 0), (Ordering::Equal, 1));

        let probe = Tuple::new(vec![b"0".to_vec()]);
        assert_eq!(compare_tuple_rec(&probe, &rec, 3, 0), (Ordering::Less, 0));
    }

    #[test]
    fn test_node_pointer_carries_child() {
        let index = IndexDesc::new(1, 1, 2);
        let node_ptr = build_node_pointer(&index, &Tuple::with_payload(42, b"payload"), 77);
        assert_eq!(node_ptr.n_fields(), 2);
        assert_eq!(node_ptr.n_fields_cmp, 1);
        let encoded = node_ptr.encode(RowFormat::Compact).unwrap();
        let view = RecView::parse(&encoded, RowFormat::Compact).unwrap();
        assert_eq!(view.child_page_no(), 77);
        assert_eq!(view.n_key_fields(1), 1);
        assert_eq!(decode_u64(view.field(0)), Some(42));
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let tuple = Tuple::from_u64(5);
        let bytes = tuple.encode(RowFormat::Redundant).unwrap();
        assert!(matches!(
            RecView::parse(&bytes[..bytes.len() - 1], RowFormat::Redundant),
            Err(StorageError::Corruption(_))
        ));
    }
}
