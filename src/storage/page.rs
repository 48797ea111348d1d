//! Slotted B-tree page
//!
//! ## Layout
//! ```text
//! +------------------------+ 0
//! | header (48 bytes)      |  page_no, prev, next, lsn, index_id, level,
//! |                        |  n_recs, heap_top, garbage, flags, insert hints
//! +------------------------+ HEADER_SIZE
//! | record heap            |  grows upward, records in insertion order
//! +------------------------+ heap_top
//! | free space             |
//! +------------------------+ page_size - 2 * n_recs
//! | slot directory         |  u16 record offsets in key order, slot 0 at
//! |                        |  the very end of the page
//! +------------------------+ page_size
//! ```
//!
//! Positions handed to and returned by a page are ranks: `0` is the
//! infimum, `1..=n_recs` are user records in key order and `n_recs + 1` is
//! the supremum. The sentinels are virtual and take no space.
//!
//! All mutation goes through [`Page::apply`] with a [`PageOp`], the same
//! operation that is written to the redo log, so replay during recovery runs
//! exactly the code that produced the page.

use std::cmp::Ordering;
use std::fmt;

use log::error;
use serde::{Deserialize, Serialize};

use super::{PageNo, FIL_NULL};
use crate::record::{compare_recs, RecView, RowFormat, REC_INFO_MIN_REC};
use crate::{Result, StorageError};

pub const HEADER_SIZE: usize = 48;
pub const SLOT_SIZE: usize = 2;

const OFF_PAGE_NO: usize = 0;
const OFF_PREV: usize = 4;
const OFF_NEXT: usize = 8;
const OFF_LSN: usize = 12;
const OFF_INDEX_ID: usize = 20;
const OFF_LEVEL: usize = 28;
const OFF_N_RECS: usize = 30;
const OFF_HEAP_TOP: usize = 32;
const OFF_GARBAGE: usize = 34;
const OFF_FLAGS: usize = 36;
const OFF_LAST_INSERT: usize = 38;
const OFF_DIRECTION: usize = 40;
const OFF_N_DIRECTION: usize = 42;

const FLAG_COMPACT: u16 = 0x0001;
const FLAG_IN_USE: u16 = 0x0002;

/// Direction of consecutive inserts recorded in the page header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertDirection {
    None,
    Left,
    Right,
}

/// Physical page mutation; also the body of a redo record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageOp {
    /// Format an empty page for `index_id` at `level`
    Create { index_id: u64, level: u16, compact: bool },
    /// Remove every record, keeping linkage and index id; set `level`
    Empty { level: u16 },
    /// Insert one record after position `after`
    InsertRec { after: u16, rec: Vec<u8> },
    /// Insert consecutive records after position `after`
    InsertList { after: u16, recs: Vec<Vec<u8>> },
    /// Delete the record at `pos`
    DeleteRec { pos: u16 },
    /// Delete records `from..to` (positions)
    DeleteRange { from: u16, to: u16 },
    /// Overwrite the record at `pos` with a record of identical size
    UpdateInPlace { pos: u16, rec: Vec<u8> },
    /// Set or clear the minimum-record flag on `pos`
    SetMinRecMark { pos: u16, on: bool },
    SetPrev(PageNo),
    SetNext(PageNo),
    SetLevel(u16),
    /// Rewrite the heap in key order, dropping garbage
    Reorganize,
    /// Page returned to the free list
    Free,
}

/// One fixed-size page image
#[derive(Clone)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Zeroed page not yet formatted for any index
    pub fn new(page_no: PageNo, page_size: usize) -> Self {
        let mut page = Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        };
        page.write_u32(OFF_PAGE_NO, page_no);
        page.write_u32(OFF_PREV, FIL_NULL);
        page.write_u32(OFF_NEXT, FIL_NULL);
        page.write_u16(OFF_HEAP_TOP, HEADER_SIZE as u16);
        page
    }

    // ---- raw header access -------------------------------------------------

    fn read_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn read_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn read_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[off..off + 8]);
        u64::from_le_bytes(b)
    }

    fn write_u16(&mut self, off: usize, v: u16) {
        self.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn write_u32(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, off: usize, v: u64) {
        self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn page_no(&self) -> PageNo {
        self.read_u32(OFF_PAGE_NO)
    }

    pub fn prev(&self) -> PageNo {
        self.read_u32(OFF_PREV)
    }

    pub fn next(&self) -> PageNo {
        self.read_u32(OFF_NEXT)
    }

    pub fn lsn(&self) -> u64 {
        self.read_u64(OFF_LSN)
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.write_u64(OFF_LSN, lsn);
    }

    pub fn index_id(&self) -> u64 {
        self.read_u64(OFF_INDEX_ID)
    }

    pub fn level(&self) -> u16 {
        self.read_u16(OFF_LEVEL)
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn n_recs(&self) -> usize {
        self.read_u16(OFF_N_RECS) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.n_recs() == 0
    }

    pub fn heap_top(&self) -> usize {
        self.read_u16(OFF_HEAP_TOP) as usize
    }

    pub fn garbage(&self) -> usize {
        self.read_u16(OFF_GARBAGE) as usize
    }

    pub fn is_compact(&self) -> bool {
        self.read_u16(OFF_FLAGS) & FLAG_COMPACT != 0
    }

    pub fn in_use(&self) -> bool {
        self.read_u16(OFF_FLAGS) & FLAG_IN_USE != 0
    }

    pub fn row_format(&self) -> RowFormat {
        if self.is_compact() {
            RowFormat::Compact
        } else {
            RowFormat::Redundant
        }
    }

    /// Position of the last inserted record, 0 if unknown
    pub fn last_insert(&self) -> usize {
        self.read_u16(OFF_LAST_INSERT) as usize
    }

    pub fn direction(&self) -> InsertDirection {
        match self.data[OFF_DIRECTION] {
            1 => InsertDirection::Left,
            2 => InsertDirection::Right,
            _ => InsertDirection::None,
        }
    }

    pub fn n_direction(&self) -> usize {
        self.read_u16(OFF_N_DIRECTION) as usize
    }

    // ---- slot directory -----------------------------------------------------

    fn slot_addr(&self, i: usize) -> usize {
        self.page_size() - SLOT_SIZE * (i + 1)
    }

    fn slot(&self, i: usize) -> usize {
        self.read_u16(self.slot_addr(i)) as usize
    }

    fn set_slot(&mut self, i: usize, off: usize) {
        let addr = self.slot_addr(i);
        self.write_u16(addr, off as u16);
    }

    fn dir_start(&self) -> usize {
        self.page_size() - SLOT_SIZE * self.n_recs()
    }

    // ---- space accounting ---------------------------------------------------

    /// Contiguous free bytes between heap and slot directory
    pub fn free_space(&self) -> usize {
        self.dir_start().saturating_sub(self.heap_top())
    }

    /// Bytes of live records (excluding slots and garbage)
    pub fn data_size(&self) -> usize {
        self.heap_top() - HEADER_SIZE - self.garbage()
    }

    /// Space available for records on an empty page
    pub fn free_space_of_empty(page_size: usize) -> usize {
        page_size - HEADER_SIZE
    }

    /// Largest record size that still guarantees two records per page
    pub fn max_rec_size(page_size: usize) -> usize {
        Self::free_space_of_empty(page_size) / 2 - 2 * SLOT_SIZE - 8
    }

    /// Record bytes that fit for `n_new` more records without reorganizing
    pub fn max_insert_size(&self, n_new: usize) -> usize {
        self.free_space().saturating_sub(SLOT_SIZE * n_new)
    }

    /// Record bytes that fit for `n_new` more records after a reorganize
    pub fn max_insert_size_after_reorganize(&self, n_new: usize) -> usize {
        Self::free_space_of_empty(self.page_size())
            .saturating_sub(self.data_size() + SLOT_SIZE * (self.n_recs() + n_new))
    }

    // ---- record access ------------------------------------------------------

    /// Record at position `pos` (1..=n_recs)
    pub fn try_rec(&self, pos: usize) -> Result<RecView<'_>> {
        if pos == 0 || pos > self.n_recs() {
            return Err(StorageError::Corruption(format!(
                "page {}: position {} outside 1..={}",
                self.page_no(),
                pos,
                self.n_recs()
            )));
        }
        let off = self.slot(pos - 1);
        if off < HEADER_SIZE || off >= self.heap_top() {
            return Err(StorageError::Corruption(format!(
                "page {}: slot {} points at {} outside heap {}..{}",
                self.page_no(),
                pos,
                off,
                HEADER_SIZE,
                self.heap_top()
            )));
        }
        RecView::parse(&self.data[off..self.heap_top()], self.row_format())
    }

    /// Record at position `pos`; a malformed record is fatal
    pub fn rec(&self, pos: usize) -> RecView<'_> {
        match self.try_rec(pos) {
            Ok(rec) => rec,
            Err(e) => self.corrupted(&e.to_string()),
        }
    }

    pub fn first_rec(&self) -> Option<RecView<'_>> {
        (!self.is_empty()).then(|| self.rec(1))
    }

    pub fn last_rec(&self) -> Option<RecView<'_>> {
        (!self.is_empty()).then(|| self.rec(self.n_recs()))
    }

    /// Log a page dump and abort; used when invariants are found broken
    /// in the middle of a structural change.
    pub fn corrupted(&self, what: &str) -> ! {
        error!("page corruption: {}\n{:?}", what, self);
        panic!("page {} corrupted: {}", self.page_no(), what);
    }

    // ---- mutation -----------------------------------------------------------

    /// Apply a physical operation. Fails only if the operation does not fit
    /// the page, which callers must rule out beforehand.
    pub fn apply(&mut self, op: &PageOp) -> Result<()> {
        match op {
            PageOp::Create {
                index_id,
                level,
                compact,
            } => {
                let page_no = self.page_no();
                self.data.fill(0);
                self.write_u32(OFF_PAGE_NO, page_no);
                self.write_u32(OFF_PREV, FIL_NULL);
                self.write_u32(OFF_NEXT, FIL_NULL);
                self.write_u64(OFF_INDEX_ID, *index_id);
                self.write_u16(OFF_LEVEL, *level);
                self.write_u16(OFF_HEAP_TOP, HEADER_SIZE as u16);
                let flags = FLAG_IN_USE | if *compact { FLAG_COMPACT } else { 0 };
                self.write_u16(OFF_FLAGS, flags);
            }
            PageOp::Empty { level } => {
                self.write_u16(OFF_N_RECS, 0);
                self.write_u16(OFF_HEAP_TOP, HEADER_SIZE as u16);
                self.write_u16(OFF_GARBAGE, 0);
                self.write_u16(OFF_LEVEL, *level);
                self.reset_insert_hints();
            }
            PageOp::InsertRec { after, rec } => {
                self.insert_rec(*after as usize, rec)?;
                self.note_insert(*after as usize);
            }
            PageOp::InsertList { after, recs } => {
                let mut pos = *after as usize;
                for rec in recs {
                    self.insert_rec(pos, rec)?;
                    pos += 1;
                }
                self.reset_insert_hints();
            }
            PageOp::DeleteRec { pos } => {
                self.delete_range(*pos as usize, *pos as usize + 1)?;
            }
            PageOp::DeleteRange { from, to } => {
                self.delete_range(*from as usize, *to as usize)?;
            }
            PageOp::UpdateInPlace { pos, rec } => {
                let size = self.try_rec(*pos as usize)?.size();
                if size != rec.len() {
                    return Err(StorageError::Corruption(format!(
                        "page {}: in-place update of {} bytes over {}",
                        self.page_no(),
                        rec.len(),
                        size
                    )));
                }
                let off = self.slot(*pos as usize - 1);
                self.data[off..off + size].copy_from_slice(rec);
            }
            PageOp::SetMinRecMark { pos, on } => {
                self.try_rec(*pos as usize)?;
                let off = self.slot(*pos as usize - 1);
                if *on {
                    self.data[off] |= REC_INFO_MIN_REC;
                } else {
                    self.data[off] &= !REC_INFO_MIN_REC;
                }
            }
            PageOp::SetPrev(p) => self.write_u32(OFF_PREV, *p),
            PageOp::SetNext(p) => self.write_u32(OFF_NEXT, *p),
            PageOp::SetLevel(l) => self.write_u16(OFF_LEVEL, *l),
            PageOp::Reorganize => self.reorganize()?,
            PageOp::Free => {
                let page_no = self.page_no();
                self.data.fill(0);
                self.write_u32(OFF_PAGE_NO, page_no);
                self.write_u32(OFF_PREV, FIL_NULL);
                self.write_u32(OFF_NEXT, FIL_NULL);
                self.write_u16(OFF_HEAP_TOP, HEADER_SIZE as u16);
            }
        }
        Ok(())
    }

    fn insert_rec(&mut self, after: usize, rec: &[u8]) -> Result<()> {
        let n = self.n_recs();
        if after > n {
            return Err(StorageError::Corruption(format!(
                "page {}: insert after {} with {} records",
                self.page_no(),
                after,
                n
            )));
        }
        if rec.len() + SLOT_SIZE > self.free_space() {
            return Err(StorageError::Index(format!(
                "page {}: {} byte record does not fit {} free",
                self.page_no(),
                rec.len(),
                self.free_space()
            )));
        }
        let off = self.heap_top();
        self.data[off..off + rec.len()].copy_from_slice(rec);
        self.write_u16(OFF_HEAP_TOP, (off + rec.len()) as u16);
        self.write_u16(OFF_N_RECS, (n + 1) as u16);
        for i in (after..n).rev() {
            let s = self.slot(i);
            self.set_slot(i + 1, s);
        }
        self.set_slot(after, off);
        Ok(())
    }

    fn delete_range(&mut self, from: usize, to: usize) -> Result<()> {
        let n = self.n_recs();
        if from == 0 || from > to || to > n + 1 {
            return Err(StorageError::Corruption(format!(
                "page {}: delete range {}..{} with {} records",
                self.page_no(),
                from,
                to,
                n
            )));
        }
        let mut freed = 0;
        for pos in from..to {
            freed += self.try_rec(pos)?.size();
        }
        let removed = to - from;
        for i in (to - 1)..n {
            let s = self.slot(i);
            self.set_slot(i - removed, s);
        }
        self.write_u16(OFF_N_RECS, (n - removed) as u16);
        let garbage = self.garbage() + freed;
        self.write_u16(OFF_GARBAGE, garbage as u16);
        if self.n_recs() == 0 {
            self.write_u16(OFF_HEAP_TOP, HEADER_SIZE as u16);
            self.write_u16(OFF_GARBAGE, 0);
        }
        self.reset_insert_hints();
        Ok(())
    }

    fn reorganize(&mut self) -> Result<()> {
        let n = self.n_recs();
        let mut recs = Vec::with_capacity(n);
        for pos in 1..=n {
            recs.push(self.try_rec(pos)?.as_bytes().to_vec());
        }
        let mut off = HEADER_SIZE;
        for (i, rec) in recs.iter().enumerate() {
            self.data[off..off + rec.len()].copy_from_slice(rec);
            self.set_slot(i, off);
            off += rec.len();
        }
        self.write_u16(OFF_HEAP_TOP, off as u16);
        self.write_u16(OFF_GARBAGE, 0);
        Ok(())
    }

    fn reset_insert_hints(&mut self) {
        self.write_u16(OFF_LAST_INSERT, 0);
        self.data[OFF_DIRECTION] = 0;
        self.write_u16(OFF_N_DIRECTION, 0);
    }

    /// Track consecutive insert direction for the split heuristics
    fn note_insert(&mut self, after: usize) {
        let last = self.last_insert();
        let (direction, n_dir) = if last != 0 && after == last {
            match self.direction() {
                InsertDirection::Left => (InsertDirection::None, 0),
                _ => (InsertDirection::Right, self.n_direction() + 1),
            }
        } else if last != 0 && after + 1 == last {
            match self.direction() {
                InsertDirection::Right => (InsertDirection::None, 0),
                _ => (InsertDirection::Left, self.n_direction() + 1),
            }
        } else {
            (InsertDirection::None, 0)
        };
        self.write_u16(OFF_LAST_INSERT, (after + 1) as u16);
        self.data[OFF_DIRECTION] = match direction {
            InsertDirection::None => 0,
            InsertDirection::Left => 1,
            InsertDirection::Right => 2,
        };
        self.write_u16(OFF_N_DIRECTION, n_dir.min(u16::MAX as usize) as u16);
    }

    // ---- validation ---------------------------------------------------------

    /// Intra-page consistency: heap bounds, record decoding, strictly
    /// ascending keys, and the minimum-record mark only on a non-leaf
    /// page's first record.
    pub fn validate(&self) -> Result<()> {
        if self.heap_top() < HEADER_SIZE || self.heap_top() > self.dir_start() {
            return Err(StorageError::Corruption(format!(
                "page {}: heap_top {} outside {}..={}",
                self.page_no(),
                self.heap_top(),
                HEADER_SIZE,
                self.dir_start()
            )));
        }
        let level = self.level();
        let mut live = 0;
        for pos in 1..=self.n_recs() {
            let rec = self.try_rec(pos)?;
            live += rec.size();
            if rec.is_min_rec() && (level == 0 || pos != 1) {
                return Err(StorageError::Corruption(format!(
                    "page {}: minimum-record mark on position {} at level {}",
                    self.page_no(),
                    pos,
                    level
                )));
            }
            if pos > 1 {
                let prev = self.try_rec(pos - 1)?;
                if prev.is_min_rec() {
                    continue;
                }
                let n_cmp = rec.n_key_fields(level).min(prev.n_key_fields(level));
                if compare_recs(&prev, &rec, n_cmp) != Ordering::Less {
                    return Err(StorageError::Corruption(format!(
                        "page {}: records {} and {} out of order: {:?} !< {:?}",
                        self.page_no(),
                        pos - 1,
                        pos,
                        prev,
                        rec
                    )));
                }
            }
        }
        if live + self.garbage() + HEADER_SIZE != self.heap_top() {
            return Err(StorageError::Corruption(format!(
                "page {}: live {} + garbage {} does not account for heap_top {}",
                self.page_no(),
                live,
                self.garbage(),
                self.heap_top()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Page {{ no: {}, level: {}, index: {}, prev: {:?}, next: {:?}, n_recs: {}, heap_top: {}, garbage: {}, lsn: {} }}",
            self.page_no(),
            self.level(),
            self.index_id(),
            (self.prev() != FIL_NULL).then(|| self.prev()),
            (self.next() != FIL_NULL).then(|| self.next()),
            self.n_recs(),
            self.heap_top(),
            self.garbage(),
            self.lsn()
        )?;
        for pos in 1..=self.n_recs() {
            match self.try_rec(pos) {
                Ok(rec) => writeln!(f, "  [{}] {:?}", pos, rec)?,
                Err(e) => writeln!(f, "  [{}] <{}>", pos, e)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Tuple;

    fn leaf(page_size: usize) -> Page {
        let mut page = Page::new(3, page_size);
        page.apply(&PageOp::Create {
            index_id: 9,
            level: 0,
            compact: true,
        })
        .unwrap();
        page
    }

    fn enc(k: u64) -> Vec<u8> {
        Tuple::from_u64(k).encode(RowFormat::Compact).unwrap()
    }

    fn keys(page: &Page) -> Vec<u64> {
        (1..=page.n_recs())
            .map(|p| Tuple::key_u64(&page.rec(p).to_tuple()).unwrap())
            .collect()
    }

    #[test]
    fn test_insert_keeps_key_order() {
        let mut page = leaf(1024);
        page.apply(&PageOp::InsertRec { after: 0, rec: enc(20) }).unwrap();
        page.apply(&PageOp::InsertRec { after: 0, rec: enc(10) }).unwrap();
        page.apply(&PageOp::InsertRec { after: 2, rec: enc(30) }).unwrap();
        page.apply(&PageOp::InsertRec { after: 2, rec: enc(25) }).unwrap();
        assert_eq!(keys(&page), vec![10, 20, 25, 30]);
        page.validate().unwrap();
    }

    #[test]
    fn test_delete_and_reorganize_reclaim_garbage() {
        let mut page = leaf(1024);
        for (i, k) in [1u64, 2, 3, 4, 5].iter().enumerate() {
            page.apply(&PageOp::InsertRec { after: i as u16, rec: enc(*k) }).unwrap();
        }
        let free_before = page.free_space();
        page.apply(&PageOp::DeleteRec { pos: 2 }).unwrap();
        page.apply(&PageOp::DeleteRange { from: 2, to: 4 }).unwrap();
        assert_eq!(keys(&page), vec![1, 5]);
        assert!(page.garbage() > 0);
        page.validate().unwrap();

        page.apply(&PageOp::Reorganize).unwrap();
        assert_eq!(page.garbage(), 0);
        assert!(page.free_space() > free_before);
        assert_eq!(keys(&page), vec![1, 5]);
        page.validate().unwrap();
    }

    #[test]
    fn test_insert_direction_tracking() {
        let mut page = leaf(1024);
        for i in 0..4u16 {
            page.apply(&PageOp::InsertRec { after: i, rec: enc(i as u64) }).unwrap();
        }
        assert_eq!(page.direction(), InsertDirection::Right);
        assert_eq!(page.n_direction(), 3);
        assert_eq!(page.last_insert(), 4);

        page.apply(&PageOp::DeleteRec { pos: 1 }).unwrap();
        assert_eq!(page.last_insert(), 0);
        assert_eq!(page.direction(), InsertDirection::None);
    }

    #[test]
    fn test_full_page_rejects_insert() {
        let mut page = leaf(1024);
        let mut i = 0u16;
        loop {
            let op = PageOp::InsertRec { after: i, rec: enc(i as u64) };
            if page.apply(&op).is_err() {
                break;
            }
            i += 1;
        }
        assert!(page.free_space() < enc(0).len() + SLOT_SIZE);
        page.validate().unwrap();
    }

    #[test]
    fn test_min_rec_mark_only_valid_on_first_nonleaf_record() {
        let mut page = leaf(1024);
        page.apply(&PageOp::InsertRec { after: 0, rec: enc(1) }).unwrap();
        page.apply(&PageOp::SetMinRecMark { pos: 1, on: true }).unwrap();
        assert!(page.validate().is_err());
        page.apply(&PageOp::SetLevel(1)).unwrap();
        assert!(page.validate().is_ok());
    }

    #[test]
    fn test_out_of_order_detected() {
        let mut page = leaf(1024);
        page.apply(&PageOp::InsertRec { after: 0, rec: enc(5) }).unwrap();
        page.apply(&PageOp::InsertRec { after: 1, rec: enc(3) }).unwrap();
        assert!(matches!(page.validate(), Err(StorageError::Corruption(_))));
    }
}
