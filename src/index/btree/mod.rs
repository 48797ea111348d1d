//! Latched B+Tree index
//!
//! ## Layout
//! Every index is a tree of fixed-size slotted pages inside a [`Space`].
//! Leaves (level 0) hold the user records; non-leaf pages hold node
//! pointers, each the unique key prefix of a child's first record plus the
//! child page number. Pages of one level form a doubly linked list in key
//! order. The leftmost node pointer of each non-leaf level carries the
//! minimum-record mark and compares below every key. The root page number
//! never changes: the tree grows by copying the root down one level and
//! shrinks by lifting a lone child back into the root.
//!
//! ## Concurrency
//! ```text
//! tree latch (S)  ->  couple S latches root..leaf  ->  leaf S/X
//! tree latch (X)  ->  bufferfix / X-latch path     ->  left, page, right X
//! ```
//! Point operations hold one leaf latch. Structural changes hold the tree
//! latch exclusive and a page reservation taken before anything is
//! modified. Leaf latches are always acquired left to right.
//!
//! ## Modules
//! - `page_cur`: in-page binary search
//! - `cursor`: latched descents and father lookup
//! - `split`: split heuristics, split and root raise
//! - `insert` / `delete` / `update`: the record state machines
//! - `compress`: merge, discard and lift
//! - `validate`: whole-tree consistency check

pub mod compress;
pub mod cursor;
pub mod delete;
pub mod insert;
pub mod page_cur;
pub mod split;
pub mod update;
pub mod validate;

pub use compress::compress_recommendation;
pub use cursor::{
    open_at_index_side, page_father, search_to_nth_level, will_cause_restructure, BtrCursor,
    Intention, LatchMode,
};
pub use delete::can_delete_without_compress;
pub use page_cur::{PageCursor, SearchMode};
pub use split::{
    insert_fits_after_split, split_rec_to_left, split_rec_to_right, sure_split_rec, SplitPoint,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::space::Space;
use crate::config::BTreeConfig;
use crate::record::{compare_tuple_rec, IndexDesc, RecView, RowFormat, Tuple};
use crate::storage::{AllocDirection, Page, PageNo, FIL_NULL};
use crate::txn::{LockMode, Mtr, TransactionId};
use crate::{Result, StorageError};

/// Structural event counters of one tree
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub splits: AtomicU64,
    pub root_raises: AtomicU64,
    pub merges: AtomicU64,
    pub lifts: AtomicU64,
    pub discards: AtomicU64,
    pub reorganizes: AtomicU64,
    pub optimistic_inserts: AtomicU64,
    pub pessimistic_inserts: AtomicU64,
    pub optimistic_deletes: AtomicU64,
    pub pessimistic_deletes: AtomicU64,
}

/// Tree shape and structural activity
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeStats {
    pub height: u16,
    pub leaf_pages: usize,
    pub non_leaf_pages: usize,
    pub splits: u64,
    pub root_raises: u64,
    pub merges: u64,
    pub lifts: u64,
    pub discards: u64,
    pub reorganizes: u64,
    pub optimistic_inserts: u64,
    pub pessimistic_inserts: u64,
    pub optimistic_deletes: u64,
    pub pessimistic_deletes: u64,
}

/// One index tree
pub struct BTree {
    space: Arc<Space>,
    index: IndexDesc,
    root_page_no: PageNo,
    config: BTreeConfig,
    latch: Arc<RwLock<()>>,
    pub(crate) counters: Counters,
}

impl BTree {
    /// Create an empty tree: a single leaf root
    pub fn create(space: Arc<Space>, index: IndexDesc, config: BTreeConfig) -> Result<Self> {
        config.validate()?;
        index.validate()?;
        if space.cache().page_size() != config.page_size {
            return Err(StorageError::InvalidArgument(format!(
                "space {} uses {} byte pages, config asks for {}",
                space.space_id(),
                space.cache().page_size(),
                config.page_size
            )));
        }

        let root_page_no = {
            let mut res = space.cache().reserve(1)?;
            let mut mtr = Mtr::start(space.cache(), space.log());
            let root = mtr.create_page(
                &mut res,
                index.index_id,
                None,
                AllocDirection::NoDirection,
                0,
                index.is_compact(),
            )?;
            mtr.commit()?;
            root
        };
        info!(
            "index {}: created in space {} with root page {}",
            index.index_id,
            space.space_id(),
            root_page_no
        );

        Ok(Self {
            space,
            index,
            root_page_no,
            config,
            latch: Arc::new(RwLock::new(())),
            counters: Counters::default(),
        })
    }

    /// Attach to an existing tree, e.g. after recovery
    pub fn open(space: Arc<Space>, index: IndexDesc, root_page_no: PageNo, config: BTreeConfig) -> Result<Self> {
        config.validate()?;
        index.validate()?;
        {
            let frame = space.cache().get(root_page_no)?;
            let root = frame.latch().read();
            if !root.in_use() || root.index_id() != index.index_id {
                return Err(StorageError::Corruption(format!(
                    "page {} is not the root of index {} (in use: {}, index {})",
                    root_page_no,
                    index.index_id,
                    root.in_use(),
                    root.index_id()
                )));
            }
        }
        Ok(Self {
            space,
            index,
            root_page_no,
            config,
            latch: Arc::new(RwLock::new(())),
            counters: Counters::default(),
        })
    }

    pub fn latch(&self) -> &Arc<RwLock<()>> {
        &self.latch
    }

    pub fn root_page_no(&self) -> PageNo {
        self.root_page_no
    }

    pub fn index(&self) -> &IndexDesc {
        &self.index
    }

    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn start_mtr(&self) -> Mtr<'_> {
        Mtr::start(self.space.cache(), self.space.log())
    }

    /// Hash and lock key of a leaf record: its encoded unique prefix
    pub(crate) fn rec_key(&self, rec: &RecView<'_>) -> Result<Vec<u8>> {
        rec.copy_prefix(self.index.n_uniq).encode(RowFormat::Compact)
    }

    /// Search tuple for a user key
    pub(crate) fn search_tuple(&self, key: &Tuple) -> Result<Tuple> {
        if key.n_fields() < self.index.n_uniq {
            return Err(StorageError::InvalidArgument(format!(
                "index {} needs {} key fields, got {}",
                self.index.index_id,
                self.index.n_uniq,
                key.n_fields()
            )));
        }
        Ok(key.prefix(self.index.n_uniq))
    }

    // ---- record operations --------------------------------------------------

    /// Insert a record; its unique prefix must not exist yet
    pub fn insert(&self, tuple: &Tuple) -> Result<()> {
        insert::insert_entry(self, tuple)
    }

    /// Delete the record with `key`, returning it
    pub fn delete(&self, key: &Tuple) -> Result<Tuple> {
        delete::delete_entry(self, key)
    }

    /// Replace the record carrying `tuple`'s key, returning the old version
    pub fn update(&self, tuple: &Tuple) -> Result<Tuple> {
        update::update_entry(self, tuple)
    }

    /// Point lookup, served from the adaptive hash index when it guesses
    /// right
    pub fn get(&self, key: &Tuple) -> Result<Option<Tuple>> {
        let search = self.search_tuple(key)?;
        let hash_key = search.encode(RowFormat::Compact)?;
        let ahi = self.space.ahi();

        if let Some(guess) = ahi.guess(self.index.index_id, &hash_key) {
            if let Some(found) = self.check_guess(guess, &search)? {
                ahi.record_hit();
                return Ok(Some(found));
            }
        }
        ahi.record_miss();

        let mut mtr = self.start_mtr();
        let cursor = search_to_nth_level(
            self,
            &mut mtr,
            0,
            &search,
            SearchMode::LessOrEqual,
            LatchMode::SearchLeaf,
            Intention::Both,
        )?;
        let found = if cursor.is_exact(self.index.n_uniq) {
            let tuple = mtr.page(cursor.page_no)?.rec(cursor.pos).to_tuple();
            ahi.remember(self.index.index_id, hash_key, cursor.page_no);
            Some(tuple)
        } else {
            None
        };
        mtr.commit()?;
        Ok(found)
    }

    /// Look the key up on a hinted page only. Hints may be stale: the page
    /// may have been freed, reused or split since.
    fn check_guess(&self, page_no: PageNo, search: &Tuple) -> Result<Option<Tuple>> {
        let Ok(frame) = self.space.cache().get(page_no) else {
            return Ok(None);
        };
        let page = frame.latch().read();
        if !page.in_use() || page.index_id() != self.index.index_id || !page.is_leaf() {
            return Ok(None);
        }
        let pc = page_cur::search(&page, search, SearchMode::LessOrEqual);
        if pc.pos == 0 || pc.pos > page.n_recs() || pc.low_match < self.index.n_uniq {
            return Ok(None);
        }
        Ok(Some(page.rec(pc.pos).to_tuple()))
    }

    /// Records with keys in `start..=end`, ascending
    pub fn range(&self, start: &Tuple, end: &Tuple) -> Result<Vec<Tuple>> {
        let start = self.search_tuple(start)?;
        let end = self.search_tuple(end)?;
        let mut mtr = self.start_mtr();
        let cursor = search_to_nth_level(
            self,
            &mut mtr,
            0,
            &start,
            SearchMode::GreaterOrEqual,
            LatchMode::SearchLeaf,
            Intention::Both,
        )?;
        let n_uniq = self.index.n_uniq;
        let mut out = Vec::new();
        self.walk_right(&mut mtr, cursor.page_no, cursor.pos, |rec| {
            if compare_tuple_rec(&end, rec, n_uniq, 0).0 == std::cmp::Ordering::Less {
                return false;
            }
            out.push(rec.to_tuple());
            true
        })?;
        mtr.commit()?;
        Ok(out)
    }

    /// Every record, ascending
    pub fn scan(&self) -> Result<Vec<Tuple>> {
        let mut mtr = self.start_mtr();
        let cursor = open_at_index_side(self, &mut mtr, true, 0, LatchMode::SearchLeaf)?;
        let mut out = Vec::new();
        self.walk_right(&mut mtr, cursor.page_no, 1, |rec| {
            out.push(rec.to_tuple());
            true
        })?;
        mtr.commit()?;
        Ok(out)
    }

    /// Visit leaf records from `page_no` position `pos` rightwards until
    /// `f` returns false. Holds at most two leaf latches, acquired left to
    /// right.
    fn walk_right(
        &self,
        mtr: &mut Mtr<'_>,
        page_no: PageNo,
        pos: usize,
        mut f: impl FnMut(&RecView<'_>) -> bool,
    ) -> Result<()> {
        let mut page_no = page_no;
        let mut pos = pos.max(1);
        loop {
            let next = {
                let page = mtr.page(page_no)?;
                for p in pos..=page.n_recs() {
                    if !f(&page.rec(p)) {
                        return Ok(());
                    }
                }
                page.next()
            };
            if next == FIL_NULL {
                return Ok(());
            }
            mtr.s_latch(next)?;
            mtr.release_page(page_no);
            page_no = next;
            pos = 1;
        }
    }

    /// Every record, descending. Moving left cannot couple latches, so each
    /// step re-descends to the predecessor of the smallest key seen so far.
    pub fn scan_rev(&self) -> Result<Vec<Tuple>> {
        let n_uniq = self.index.n_uniq;
        let mut out = Vec::new();

        let mut boundary = {
            let mut mtr = self.start_mtr();
            let cursor = open_at_index_side(self, &mut mtr, false, 0, LatchMode::SearchLeaf)?;
            let boundary = collect_rev(mtr.page(cursor.page_no)?, None, n_uniq, &mut out);
            mtr.commit()?;
            boundary
        };

        while let Some(key) = boundary {
            let mut mtr = self.start_mtr();
            let cursor = search_to_nth_level(
                self,
                &mut mtr,
                0,
                &key,
                SearchMode::Less,
                LatchMode::SearchPrev,
                Intention::Both,
            )?;
            boundary = if cursor.pos > 0 {
                collect_rev(mtr.page(cursor.page_no)?, Some(cursor.pos), n_uniq, &mut out)
            } else if cursor.left_page_no != FIL_NULL {
                collect_rev(mtr.page(cursor.left_page_no)?, None, n_uniq, &mut out)
            } else {
                None
            };
            mtr.commit()?;
        }
        Ok(out)
    }

    // ---- record locks -------------------------------------------------------

    /// Lock the record with `key` for `txn`. The lock is taken while the
    /// leaf is latched so the record cannot move in between.
    pub fn lock_record(&self, txn: TransactionId, key: &Tuple, mode: LockMode) -> Result<()> {
        let search = self.search_tuple(key)?;
        let mut mtr = self.start_mtr();
        let cursor = search_to_nth_level(
            self,
            &mut mtr,
            0,
            &search,
            SearchMode::LessOrEqual,
            LatchMode::SearchLeaf,
            Intention::Both,
        )?;
        if !cursor.is_exact(self.index.n_uniq) {
            return Err(StorageError::NotFound);
        }
        let lock_key = self.rec_key(&mtr.page(cursor.page_no)?.rec(cursor.pos))?;
        let locks = self.space.locks();
        match mode {
            LockMode::Shared => locks.acquire_shared(txn, cursor.page_no, lock_key)?,
            LockMode::Exclusive => locks.acquire_exclusive(txn, cursor.page_no, lock_key)?,
        }
        mtr.commit()?;
        Ok(())
    }

    pub fn release_locks(&self, txn: TransactionId) {
        self.space.locks().release_locks(txn);
    }

    /// Leaf page currently holding `key`
    pub fn locate(&self, key: &Tuple) -> Result<Option<PageNo>> {
        let search = self.search_tuple(key)?;
        let mut mtr = self.start_mtr();
        let cursor = search_to_nth_level(
            self,
            &mut mtr,
            0,
            &search,
            SearchMode::LessOrEqual,
            LatchMode::SearchLeaf,
            Intention::Both,
        )?;
        mtr.commit()?;
        Ok(cursor.is_exact(self.index.n_uniq).then_some(cursor.page_no))
    }

    // ---- introspection ------------------------------------------------------

    /// Level of the root; 0 for a single-leaf tree
    pub fn height(&self) -> Result<u16> {
        let frame = self.space.cache().get(self.root_page_no)?;
        let level = frame.latch().read().level();
        Ok(level)
    }

    /// Full consistency check; problems are logged
    pub fn validate(&self) -> bool {
        validate::validate_index(self)
    }

    pub fn stats(&self) -> Result<BTreeStats> {
        let (leaf, non_leaf) = self.space.cache().segment_pages(self.index.index_id);
        let c = &self.counters;
        Ok(BTreeStats {
            height: self.height()?,
            leaf_pages: leaf.len(),
            non_leaf_pages: non_leaf.len(),
            splits: c.splits.load(Ordering::Relaxed),
            root_raises: c.root_raises.load(Ordering::Relaxed),
            merges: c.merges.load(Ordering::Relaxed),
            lifts: c.lifts.load(Ordering::Relaxed),
            discards: c.discards.load(Ordering::Relaxed),
            reorganizes: c.reorganizes.load(Ordering::Relaxed),
            optimistic_inserts: c.optimistic_inserts.load(Ordering::Relaxed),
            pessimistic_inserts: c.pessimistic_inserts.load(Ordering::Relaxed),
            optimistic_deletes: c.optimistic_deletes.load(Ordering::Relaxed),
            pessimistic_deletes: c.pessimistic_deletes.load(Ordering::Relaxed),
        })
    }
}

/// Push the records at positions `upto..=1` (the whole page for `None`) in
/// descending order; returns the key of the smallest one pushed
fn collect_rev(page: &Page, upto: Option<usize>, n_uniq: usize, out: &mut Vec<Tuple>) -> Option<Tuple> {
    let upto = upto.unwrap_or(page.n_recs()).min(page.n_recs());
    for pos in (1..=upto).rev() {
        out.push(page.rec(pos).to_tuple());
    }
    (upto > 0).then(|| page.rec(1).copy_prefix(n_uniq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn tree_with(config: BTreeConfig) -> BTree {
        let space = Space::new(1, &config).unwrap();
        BTree::create(space, IndexDesc::new(11, 1, 2), config).unwrap()
    }

    fn tree() -> BTree {
        tree_with(BTreeConfig::for_testing())
    }

    fn keys(tuples: &[Tuple]) -> Vec<u64> {
        tuples.iter().filter_map(Tuple::key_u64).collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = tree();
        assert_eq!(tree.height().unwrap(), 0);
        assert!(tree.get(&Tuple::from_u64(1)).unwrap().is_none());
        assert!(tree.scan().unwrap().is_empty());
        assert!(tree.scan_rev().unwrap().is_empty());
        assert!(tree.validate());
    }

    #[test]
    fn test_insert_get_duplicate() {
        let tree = tree();
        tree.insert(&Tuple::with_payload(5, b"five")).unwrap();
        let err = tree.insert(&Tuple::with_payload(5, b"again")).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey));
        let rec = tree.get(&Tuple::from_u64(5)).unwrap().unwrap();
        assert_eq!(rec.fields[1], b"five".to_vec());
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        let tree = tree();
        let err = tree.insert(&Tuple::from_u64(1)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        let err = tree.get(&Tuple::new(Vec::new())).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let tree = tree();
        let err = tree.insert(&Tuple::with_payload(1, &[0u8; 2000])).unwrap_err();
        assert!(matches!(err, StorageError::RecordTooBig { .. }));
    }

    #[test]
    fn test_scans_and_range_across_pages() {
        let tree = tree();
        let mut ks: Vec<u64> = (0..300).collect();
        ks.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for &k in &ks {
            tree.insert(&Tuple::with_payload(k, &[3u8; 24])).unwrap();
        }
        assert!(tree.height().unwrap() >= 1);
        assert!(tree.validate());

        let forward = keys(&tree.scan().unwrap());
        assert_eq!(forward, (0..300).collect::<Vec<_>>());
        let backward = keys(&tree.scan_rev().unwrap());
        assert_eq!(backward, (0..300).rev().collect::<Vec<_>>());
        let range = keys(&tree.range(&Tuple::from_u64(95), &Tuple::from_u64(205)).unwrap());
        assert_eq!(range, (95..=205).collect::<Vec<_>>());
        assert!(tree.range(&Tuple::from_u64(400), &Tuple::from_u64(500)).unwrap().is_empty());
    }

    #[test]
    fn test_get_uses_hash_hints() {
        let tree = tree();
        for k in 0..50u64 {
            tree.insert(&Tuple::with_payload(k, b"v")).unwrap();
        }
        let before = tree.space().ahi().stats();
        tree.get(&Tuple::from_u64(20)).unwrap().unwrap();
        tree.get(&Tuple::from_u64(20)).unwrap().unwrap();
        let after = tree.space().ahi().stats();
        assert_eq!(after.hits, before.hits + 1);
        assert_eq!(after.misses, before.misses + 1);
    }

    #[test]
    fn test_stale_hint_falls_back_to_descent() {
        let tree = tree();
        for k in 0..40u64 {
            tree.insert(&Tuple::with_payload(k, &[1u8; 40])).unwrap();
        }
        tree.get(&Tuple::from_u64(3)).unwrap().unwrap();
        tree.delete(&Tuple::from_u64(3)).unwrap();
        assert!(tree.get(&Tuple::from_u64(3)).unwrap().is_none());
    }

    #[test]
    fn test_delete_returns_record_and_missing_key() {
        let tree = tree();
        tree.insert(&Tuple::with_payload(1, b"one")).unwrap();
        let removed = tree.delete(&Tuple::from_u64(1)).unwrap();
        assert_eq!(removed.fields[1], b"one".to_vec());
        assert!(matches!(tree.delete(&Tuple::from_u64(1)), Err(StorageError::NotFound)));
    }

    #[test]
    fn test_stats_track_structure() {
        let tree = tree();
        for k in 0..200u64 {
            tree.insert(&Tuple::with_payload(k, &[9u8; 30])).unwrap();
        }
        let stats = tree.stats().unwrap();
        assert!(stats.root_raises >= 1);
        assert!(stats.splits >= 1);
        assert!(stats.leaf_pages > 1);
        assert!(stats.non_leaf_pages >= 1);
        assert_eq!(stats.height, tree.height().unwrap());
    }

    #[test]
    fn test_open_checks_root() {
        let tree = tree();
        let reopened = BTree::open(
            Arc::clone(&tree.space),
            tree.index().clone(),
            tree.root_page_no(),
            BTreeConfig::for_testing(),
        )
        .unwrap();
        assert_eq!(reopened.root_page_no(), tree.root_page_no());
        let wrong = BTree::open(
            Arc::clone(&tree.space),
            IndexDesc::new(99, 1, 2),
            tree.root_page_no(),
            BTreeConfig::for_testing(),
        );
        assert!(matches!(wrong, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_lock_record() {
        let tree = tree();
        tree.insert(&Tuple::with_payload(4, b"x")).unwrap();
        tree.lock_record(1, &Tuple::from_u64(4), LockMode::Exclusive).unwrap();
        assert!(tree.lock_record(2, &Tuple::from_u64(4), LockMode::Shared).is_err());
        tree.release_locks(1);
        tree.lock_record(2, &Tuple::from_u64(4), LockMode::Shared).unwrap();
        assert!(matches!(
            tree.lock_record(2, &Tuple::from_u64(5), LockMode::Shared),
            Err(StorageError::NotFound)
        ));
    }
}
