//! Row-Level Lock Manager
//!
//! Shared/exclusive record locks keyed by (page, record key). The B-tree
//! never takes row locks itself; it notifies the lock manager whenever
//! records change pages (split, merge, discard, root raise, lift) so locks
//! travel with their records.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::storage::PageNo;
use crate::{Result, StorageError};

pub type TransactionId = u64;

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock (read)
    Shared,
    /// Exclusive lock (write)
    Exclusive,
}

/// Identity of a record lock: the page currently holding the record plus
/// the record's unique key prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecLockId {
    pub page_no: PageNo,
    pub key: Vec<u8>,
}

/// Lock entry for a single record
struct LockEntry {
    /// Current lock holders: (txn_id, lock_mode)
    holders: RwLock<Vec<(TransactionId, LockMode)>>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            holders: RwLock::new(Vec::new()),
        }
    }

    fn can_grant(&self, mode: LockMode, txn_id: TransactionId) -> bool {
        let holders = self.holders.read();
        match mode {
            LockMode::Shared => !holders
                .iter()
                .any(|(tid, m)| *m == LockMode::Exclusive && *tid != txn_id),
            LockMode::Exclusive => holders.iter().all(|(tid, _)| *tid == txn_id),
        }
    }

    fn grant(&self, txn_id: TransactionId, mode: LockMode) {
        let mut holders = self.holders.write();
        holders.retain(|(tid, _)| *tid != txn_id);
        holders.push((txn_id, mode));
    }

    fn release(&self, txn_id: TransactionId) {
        self.holders.write().retain(|(tid, _)| *tid != txn_id);
    }

    fn holds_lock(&self, txn_id: TransactionId) -> Option<LockMode> {
        self.holders
            .read()
            .iter()
            .find(|(tid, _)| *tid == txn_id)
            .map(|(_, mode)| *mode)
    }

    fn holders(&self) -> Vec<TransactionId> {
        self.holders.read().iter().map(|(tid, _)| *tid).collect()
    }

    /// Fold another entry's holders into this one (strongest mode wins)
    fn absorb(&self, other: &LockEntry) {
        let incoming = other.holders.read().clone();
        let mut holders = self.holders.write();
        for (tid, mode) in incoming {
            match holders.iter_mut().find(|(t, _)| *t == tid) {
                Some(existing) if mode == LockMode::Exclusive => existing.1 = mode,
                Some(_) => {}
                None => holders.push((tid, mode)),
            }
        }
    }
}

/// Lock Manager - manages record locks and their migration across pages
pub struct LockManager {
    locks: DashMap<RecLockId, Arc<LockEntry>>,

    /// Transaction lock tracking: txn_id -> set of locked records
    txn_locks: Mutex<HashMap<TransactionId, HashSet<RecLockId>>>,

    /// Number of lock migrations triggered by page reorganization
    reorganize_events: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            txn_locks: Mutex::new(HashMap::new()),
            reorganize_events: AtomicU64::new(0),
        }
    }

    pub fn acquire_shared(&self, txn_id: TransactionId, page_no: PageNo, key: Vec<u8>) -> Result<()> {
        self.acquire_lock(txn_id, RecLockId { page_no, key }, LockMode::Shared)
    }

    pub fn acquire_exclusive(&self, txn_id: TransactionId, page_no: PageNo, key: Vec<u8>) -> Result<()> {
        self.acquire_lock(txn_id, RecLockId { page_no, key }, LockMode::Exclusive)
    }

    fn acquire_lock(&self, txn_id: TransactionId, id: RecLockId, mode: LockMode) -> Result<()> {
        let entry = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(LockEntry::new()))
            .clone();

        if let Some(current) = entry.holds_lock(txn_id) {
            if current == LockMode::Exclusive || mode == LockMode::Shared {
                return Ok(());
            }
        }

        if !entry.can_grant(mode, txn_id) {
            // Fail fast; waiting and deadlock resolution belong to the caller
            return Err(StorageError::Lock(format!(
                "txn {} cannot acquire {:?} lock on page {} record {:02x?}",
                txn_id, mode, id.page_no, id.key
            )));
        }
        entry.grant(txn_id, mode);
        self.txn_locks.lock().entry(txn_id).or_default().insert(id);
        Ok(())
    }

    /// Lock mode `txn_id` holds on a record, if any
    pub fn holds(&self, txn_id: TransactionId, page_no: PageNo, key: &[u8]) -> Option<LockMode> {
        let id = RecLockId {
            page_no,
            key: key.to_vec(),
        };
        self.locks.get(&id).and_then(|e| e.holds_lock(txn_id))
    }

    /// Release all locks held by a transaction
    pub fn release_locks(&self, txn_id: TransactionId) {
        let locked = self.txn_locks.lock().remove(&txn_id).unwrap_or_default();
        for id in locked {
            let now_free = match self.locks.get(&id) {
                Some(entry) => {
                    entry.release(txn_id);
                    entry.holders().is_empty()
                }
                None => false,
            };
            if now_free {
                self.locks.remove_if(&id, |_, e| e.holders().is_empty());
            }
        }
    }

    /// Number of locked records on a page
    pub fn locks_on_page(&self, page_no: PageNo) -> usize {
        self.locks.iter().filter(|e| e.key().page_no == page_no).count()
    }

    // ---- migration ----------------------------------------------------------

    fn move_lock(&self, id: RecLockId, to: PageNo) {
        let Some((old_id, entry)) = self.locks.remove(&id) else {
            return;
        };
        let new_id = RecLockId {
            page_no: to,
            key: old_id.key.clone(),
        };
        let holders = entry.holders();
        match self.locks.get(&new_id) {
            Some(existing) => existing.absorb(&entry),
            None => {
                drop(self.locks.insert(new_id.clone(), entry));
            }
        }
        let mut txn_locks = self.txn_locks.lock();
        for tid in holders {
            if let Some(set) = txn_locks.get_mut(&tid) {
                set.remove(&old_id);
                set.insert(new_id.clone());
            }
        }
    }

    fn move_keys(&self, from: PageNo, to: PageNo, keys: &[Vec<u8>]) {
        for key in keys {
            self.move_lock(
                RecLockId {
                    page_no: from,
                    key: key.clone(),
                },
                to,
            );
        }
    }

    fn move_page(&self, from: PageNo, to: PageNo) {
        let ids: Vec<RecLockId> = self
            .locks
            .iter()
            .filter(|e| e.key().page_no == from)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.move_lock(id, to);
        }
    }

    /// Records `moved` went from `left` to the new right page of a split
    pub fn update_split_right(&self, right: PageNo, left: PageNo, moved: &[Vec<u8>]) {
        self.move_keys(left, right, moved);
    }

    /// Records `moved` went from `right` to the new left page of a split
    pub fn update_split_left(&self, right: PageNo, left: PageNo, moved: &[Vec<u8>]) {
        self.move_keys(right, left, moved);
    }

    /// `right` was merged into `left`
    pub fn update_merge_left(&self, left: PageNo, right: PageNo) {
        self.move_page(right, left);
    }

    /// `left` was merged into `right`
    pub fn update_merge_right(&self, right: PageNo, left: PageNo) {
        self.move_page(left, right);
    }

    /// `page` is discarded; its locks are inherited by `heir`
    pub fn update_discard(&self, heir: PageNo, page: PageNo) {
        self.move_page(page, heir);
    }

    /// Root content moved down to `new_page`
    pub fn update_root_raise(&self, new_page: PageNo, root: PageNo) {
        self.move_page(root, new_page);
    }

    /// All records of `page` were copied to `new_page` and `page` freed
    pub fn update_copy_and_discard(&self, new_page: PageNo, page: PageNo) {
        self.move_page(page, new_page);
    }

    /// Records of `page` were rewritten in place. Locks are keyed by record
    /// key, so only the event is counted.
    pub fn move_reorganize_page(&self, _page: PageNo) {
        self.reorganize_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LockManagerStats {
        let txn_locks = self.txn_locks.lock();
        LockManagerStats {
            total_locks: self.locks.len() as u64,
            active_transactions: txn_locks.len() as u64,
            total_locked_rows: txn_locks.values().map(|s| s.len() as u64).sum(),
            reorganize_events: self.reorganize_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock manager statistics
#[derive(Debug, Clone)]
pub struct LockManagerStats {
    pub total_locks: u64,
    pub active_transactions: u64,
    pub total_locked_rows: u64,
    pub reorganize_events: u64,
}
