//! Page cache
//!
//! In-memory frame table owning every page of the tablespace. Each frame
//! carries the page's reader/writer latch; the cache itself never latches
//! page contents, that is the mini-transaction's job.
//!
//! Allocation is two-phase: structural operations first [`reserve`] the
//! number of pages they may need, so that running out of space is detected
//! before any page is modified, then [`alloc`] against the reservation.
//!
//! [`reserve`]: PageCache::reserve
//! [`alloc`]: PageCache::alloc

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use super::page::Page;
use super::PageNo;
use crate::{Result, StorageError};

/// Preferred placement of a new page relative to the hint page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDirection {
    /// Right after the hint (ascending inserts)
    Up,
    /// Right before the hint (descending inserts)
    Down,
    /// Anywhere
    NoDirection,
}

/// A cached page: its latch plus the pin count of bufferfixes
pub struct Frame {
    page_no: PageNo,
    latch: Arc<RwLock<Page>>,
    fix_count: AtomicUsize,
}

impl Frame {
    fn new(page_no: PageNo, page_size: usize) -> Self {
        Self {
            page_no,
            latch: Arc::new(RwLock::new(Page::new(page_no, page_size))),
            fix_count: AtomicUsize::new(0),
        }
    }

    pub fn page_no(&self) -> PageNo {
        self.page_no
    }

    /// The page latch; guards are taken with `read_arc`/`write_arc` so the
    /// mini-transaction memo can own them.
    pub fn latch(&self) -> &Arc<RwLock<Page>> {
        &self.latch
    }

    pub fn fix(&self) {
        self.fix_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unfix(&self) {
        self.fix_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn fix_count(&self) -> usize {
        self.fix_count.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Segments {
    leaf: BTreeSet<PageNo>,
    non_leaf: BTreeSet<PageNo>,
}

struct AllocState {
    next_page_no: PageNo,
    free: BTreeSet<PageNo>,
    reserved: usize,
    segments: AHashMap<u64, Segments>,
}

impl AllocState {
    fn used(&self) -> usize {
        self.next_page_no as usize - self.free.len()
    }
}

/// Page cache statistics
#[derive(Debug, Default, Clone)]
pub struct PageCacheStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub reserved_pages: usize,
    pub page_gets: u64,
    pub allocs: u64,
    pub frees: u64,
}

pub struct PageCache {
    page_size: usize,
    max_pages: usize,
    frames: RwLock<AHashMap<PageNo, Arc<Frame>>>,
    alloc: Mutex<AllocState>,
    page_gets: AtomicU64,
    allocs: AtomicU64,
    frees: AtomicU64,
}

/// Pages set aside for one structural operation; unused pages go back to
/// the pool when the reservation is dropped.
pub struct Reservation<'a> {
    cache: &'a PageCache,
    remaining: usize,
}

impl Reservation<'_> {
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            let mut state = self.cache.alloc.lock();
            state.reserved -= self.remaining;
        }
    }
}

impl PageCache {
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        Self {
            page_size,
            max_pages,
            frames: RwLock::new(AHashMap::new()),
            alloc: Mutex::new(AllocState {
                next_page_no: 0,
                free: BTreeSet::new(),
                reserved: 0,
                segments: AHashMap::new(),
            }),
            page_gets: AtomicU64::new(0),
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Look up a page frame. A missing page is corruption: every page
    /// number reachable from a tree was allocated through this cache.
    pub fn get(&self, page_no: PageNo) -> Result<Arc<Frame>> {
        self.page_gets.fetch_add(1, Ordering::Relaxed);
        self.frames
            .read()
            .get(&page_no)
            .cloned()
            .ok_or_else(|| StorageError::Corruption(format!("page {} not in cache", page_no)))
    }

    /// Set aside `n` pages for a structural change
    pub fn reserve(&self, n: usize) -> Result<Reservation<'_>> {
        let mut state = self.alloc.lock();
        let committed = state.used() + state.reserved;
        if committed + n > self.max_pages {
            return Err(StorageError::ResourceExhausted(format!(
                "cannot reserve {} pages: {} used, {} reserved, capacity {}",
                n,
                state.used(),
                state.reserved,
                self.max_pages
            )));
        }
        state.reserved += n;
        Ok(Reservation {
            cache: self,
            remaining: n,
        })
    }

    /// Allocate a page for `index_id` at `level`, preferring the page next
    /// to `hint` in `direction` so sequential workloads stay contiguous.
    /// The returned frame holds an unformatted page.
    pub fn alloc(
        &self,
        reservation: &mut Reservation<'_>,
        index_id: u64,
        hint: Option<PageNo>,
        direction: AllocDirection,
        level: u16,
    ) -> Result<Arc<Frame>> {
        if reservation.remaining == 0 {
            return Err(StorageError::ResourceExhausted(
                "allocation exceeds reservation".into(),
            ));
        }
        let (page_no, is_new) = {
            let mut state = self.alloc.lock();
            let wanted = hint.and_then(|h| match direction {
                AllocDirection::Up => h.checked_add(1),
                AllocDirection::Down => h.checked_sub(1),
                AllocDirection::NoDirection => None,
            });
            let picked = match wanted {
                Some(p) if state.free.contains(&p) => Some(p),
                _ => state.free.iter().next().copied(),
            };
            let (page_no, is_new) = match picked {
                Some(p) => {
                    state.free.remove(&p);
                    (p, false)
                }
                None => {
                    let p = state.next_page_no;
                    state.next_page_no += 1;
                    (p, true)
                }
            };
            state.reserved -= 1;
            let seg = state.segments.entry(index_id).or_default();
            if level == 0 {
                seg.leaf.insert(page_no);
            } else {
                seg.non_leaf.insert(page_no);
            }
            (page_no, is_new)
        };
        reservation.remaining -= 1;
        self.allocs.fetch_add(1, Ordering::Relaxed);

        if is_new {
            let frame = Arc::new(Frame::new(page_no, self.page_size));
            self.frames.write().insert(page_no, Arc::clone(&frame));
            Ok(frame)
        } else {
            self.get(page_no)
        }
    }

    /// Return a page to the free list. The page content must already have
    /// been reset by the owning mini-transaction.
    pub fn free(&self, index_id: u64, page_no: PageNo) {
        let mut state = self.alloc.lock();
        if let Some(seg) = state.segments.get_mut(&index_id) {
            seg.leaf.remove(&page_no);
            seg.non_leaf.remove(&page_no);
        }
        state.free.insert(page_no);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Move a page between an index's leaf and non-leaf segment after its
    /// level changed
    pub fn set_segment(&self, index_id: u64, page_no: PageNo, level: u16) {
        let mut state = self.alloc.lock();
        let seg = state.segments.entry(index_id).or_default();
        seg.leaf.remove(&page_no);
        seg.non_leaf.remove(&page_no);
        if level == 0 {
            seg.leaf.insert(page_no);
        } else {
            seg.non_leaf.insert(page_no);
        }
    }

    /// Pages owned by an index: (leaf segment, non-leaf segment)
    pub fn segment_pages(&self, index_id: u64) -> (Vec<PageNo>, Vec<PageNo>) {
        let state = self.alloc.lock();
        match state.segments.get(&index_id) {
            Some(seg) => (
                seg.leaf.iter().copied().collect(),
                seg.non_leaf.iter().copied().collect(),
            ),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Rebuild allocation state from page contents (recovery)
    pub(crate) fn install_recovered(&self, page: Page) {
        let page_no = page.page_no();
        let in_use = page.in_use();
        let index_id = page.index_id();
        let level = page.level();
        {
            let mut frames = self.frames.write();
            let frame = frames
                .entry(page_no)
                .or_insert_with(|| Arc::new(Frame::new(page_no, self.page_size)));
            *frame.latch().write() = page;
        }
        let mut state = self.alloc.lock();
        if page_no >= state.next_page_no {
            for p in state.next_page_no..page_no {
                state.free.insert(p);
            }
            state.next_page_no = page_no + 1;
        }
        if in_use {
            state.free.remove(&page_no);
            let seg = state.segments.entry(index_id).or_default();
            if level == 0 {
                seg.leaf.insert(page_no);
            } else {
                seg.non_leaf.insert(page_no);
            }
        } else {
            state.free.insert(page_no);
        }
    }

    /// All page numbers with a frame, ascending
    pub fn page_numbers(&self) -> Vec<PageNo> {
        let mut pages: Vec<PageNo> = self.frames.read().keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn stats(&self) -> PageCacheStats {
        let state = self.alloc.lock();
        PageCacheStats {
            total_pages: state.next_page_no as usize,
            free_pages: state.free.len(),
            reserved_pages: state.reserved,
            page_gets: self.page_gets.load(Ordering::Relaxed),
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_prefers_neighbor_of_hint() {
        let cache = PageCache::new(1024, 64);
        let mut res = cache.reserve(5).unwrap();
        let pages: Vec<PageNo> = (0..5)
            .map(|_| {
                cache
                    .alloc(&mut res, 1, None, AllocDirection::NoDirection, 0)
                    .unwrap()
                    .page_no()
            })
            .collect();
        assert_eq!(pages, vec![0, 1, 2, 3, 4]);

        cache.free(1, 1);
        cache.free(1, 3);
        let mut res = cache.reserve(1).unwrap();
        let frame = cache
            .alloc(&mut res, 1, Some(2), AllocDirection::Up, 0)
            .unwrap();
        assert_eq!(frame.page_no(), 3);
    }

    #[test]
    fn test_reservation_limits_capacity() {
        let cache = PageCache::new(1024, 4);
        let res = cache.reserve(3).unwrap();
        assert!(matches!(
            cache.reserve(2),
            Err(StorageError::ResourceExhausted(_))
        ));
        drop(res);
        assert!(cache.reserve(4).is_ok());
        assert_eq!(cache.stats().reserved_pages, 0);
    }

    #[test]
    fn test_alloc_beyond_reservation_fails() {
        let cache = PageCache::new(1024, 16);
        let mut res = cache.reserve(1).unwrap();
        cache
            .alloc(&mut res, 7, None, AllocDirection::NoDirection, 1)
            .unwrap();
        assert!(cache
            .alloc(&mut res, 7, None, AllocDirection::NoDirection, 1)
            .is_err());
        let (leaf, non_leaf) = cache.segment_pages(7);
        assert!(leaf.is_empty());
        assert_eq!(non_leaf, vec![0]);
    }

    #[test]
    fn test_missing_page_is_corruption() {
        let cache = PageCache::new(1024, 16);
        assert!(matches!(cache.get(42), Err(StorageError::Corruption(_))));
    }
}
