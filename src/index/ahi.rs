//! Adaptive Hash Index
//!
//! Remembers which leaf page a fully matched key was last found on so that
//! point lookups can skip the root-to-leaf descent. A hint is only a guess:
//! the caller latches the guessed page and re-checks it before trusting it.
//! Hints for a page are dropped whenever the page content is rewritten.
//!
//! Hit/miss counters exist twice: per instance, and process-wide for
//! diagnostics across every tree in the process.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use crate::storage::PageNo;

/// Default number of remembered keys before the index is cleared
pub const DEFAULT_AHI_CAPACITY: usize = 64 * 1024;

static GLOBAL_HITS: AtomicU64 = AtomicU64::new(0);
static GLOBAL_MISSES: AtomicU64 = AtomicU64::new(0);
static GLOBAL_PAGE_DROPS: AtomicU64 = AtomicU64::new(0);

/// Hash index statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AhiStats {
    pub hits: u64,
    pub misses: u64,
    pub page_drops: u64,
    pub entries: usize,
}

impl AhiStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Process-wide counters, summed over every adaptive hash index
pub fn global_metrics() -> AhiStats {
    AhiStats {
        hits: GLOBAL_HITS.load(Ordering::Relaxed),
        misses: GLOBAL_MISSES.load(Ordering::Relaxed),
        page_drops: GLOBAL_PAGE_DROPS.load(Ordering::Relaxed),
        entries: 0,
    }
}

/// Reset the process-wide counters
pub fn reset_global_metrics() {
    GLOBAL_HITS.store(0, Ordering::Relaxed);
    GLOBAL_MISSES.store(0, Ordering::Relaxed);
    GLOBAL_PAGE_DROPS.store(0, Ordering::Relaxed);
}

type HashKey = (u64, Vec<u8>);

#[derive(Default)]
struct AhiInner {
    by_key: AHashMap<HashKey, PageNo>,
    by_page: AHashMap<PageNo, AHashSet<HashKey>>,
}

pub struct AdaptiveHashIndex {
    inner: RwLock<AhiInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    page_drops: AtomicU64,
}

impl AdaptiveHashIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(AhiInner::default()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            page_drops: AtomicU64::new(0),
        }
    }

    /// Page a key was last found on
    pub fn guess(&self, index_id: u64, key: &[u8]) -> Option<PageNo> {
        self.inner
            .read()
            .by_key
            .get(&(index_id, key.to_vec()))
            .copied()
    }

    /// Remember that `key` lives on `page_no`
    pub fn remember(&self, index_id: u64, key: Vec<u8>, page_no: PageNo) {
        let mut inner = self.inner.write();
        if inner.by_key.len() >= self.capacity {
            inner.by_key.clear();
            inner.by_page.clear();
        }
        let hash_key = (index_id, key);
        if let Some(old) = inner.by_key.insert(hash_key.clone(), page_no) {
            if old != page_no {
                if let Some(set) = inner.by_page.get_mut(&old) {
                    set.remove(&hash_key);
                }
            }
        }
        inner.by_page.entry(page_no).or_default().insert(hash_key);
    }

    /// Forget a single key (record deleted)
    pub fn forget(&self, index_id: u64, key: &[u8]) {
        let mut inner = self.inner.write();
        let hash_key = (index_id, key.to_vec());
        if let Some(page_no) = inner.by_key.remove(&hash_key) {
            if let Some(set) = inner.by_page.get_mut(&page_no) {
                set.remove(&hash_key);
            }
        }
    }

    /// Drop every hint pointing at `page_no`; called before the page's
    /// records are moved, reorganized or the page is freed.
    pub fn drop_page_hash_index(&self, page_no: PageNo) {
        let mut inner = self.inner.write();
        if let Some(keys) = inner.by_page.remove(&page_no) {
            for key in keys {
                inner.by_key.remove(&key);
            }
            self.page_drops.fetch_add(1, Ordering::Relaxed);
            GLOBAL_PAGE_DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of hints pointing at `page_no`
    pub fn page_entries(&self, page_no: PageNo) -> usize {
        self.inner.read().by_page.get(&page_no).map_or(0, |s| s.len())
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        GLOBAL_HITS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        GLOBAL_MISSES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AhiStats {
        AhiStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            page_drops: self.page_drops.load(Ordering::Relaxed),
            entries: self.inner.read().by_key.len(),
        }
    }

    /// Reset this instance's counters
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.page_drops.store(0, Ordering::Relaxed);
    }
}

impl Default for AdaptiveHashIndex {
    fn default() -> Self {
        Self::new(DEFAULT_AHI_CAPACITY)
    }
}
