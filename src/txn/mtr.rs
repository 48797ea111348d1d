//! Mini-transaction
//!
//! The unit of atomicity and latch lifetime for page changes. A mtr owns a
//! memo of every latch and bufferfix it acquired; they are all released
//! together at [`Mtr::commit`] (or individually through savepoints). Every
//! page change goes through [`Mtr::apply`], which buffers the redo record
//! and mutates the X-latched page. At commit the buffered records are
//! appended to the redo log as one frame and the touched pages are stamped
//! with their LSNs before any latch is released.

use std::sync::Arc;

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use log::{error, warn};
use parking_lot::{RawRwLock, RwLock};

use super::redo::{Lsn, RedoLog};
use crate::storage::{AllocDirection, Frame, Page, PageCache, PageNo, PageOp, Reservation};
use crate::{Result, StorageError};

pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;
type TreeReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type TreeWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Page latch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchKind {
    Shared,
    Exclusive,
}

// Tree guards are only held, never read
#[allow(dead_code)]
enum MemoSlot {
    TreeS(TreeReadGuard),
    TreeX(TreeWriteGuard),
    PageS(PageNo, PageReadGuard),
    PageX(PageNo, PageWriteGuard),
    BufFix(Arc<Frame>),
    Released,
}

/// Position in the memo returned by [`Mtr::set_savepoint`]
pub type Savepoint = usize;

pub struct Mtr<'a> {
    cache: &'a PageCache,
    log: &'a RedoLog,
    memo: Vec<MemoSlot>,
    log_buf: Vec<(PageNo, PageOp)>,
    freed: Vec<(u64, PageNo)>,
    committed: bool,
}

impl<'a> Mtr<'a> {
    pub fn start(cache: &'a PageCache, log: &'a RedoLog) -> Self {
        Self {
            cache,
            log,
            memo: Vec::new(),
            log_buf: Vec::new(),
            freed: Vec::new(),
            committed: false,
        }
    }

    pub fn cache(&self) -> &'a PageCache {
        self.cache
    }

    // ---- tree latch ---------------------------------------------------------

    pub fn s_lock_tree(&mut self, latch: &Arc<RwLock<()>>) {
        self.memo.push(MemoSlot::TreeS(latch.read_arc()));
    }

    pub fn x_lock_tree(&mut self, latch: &Arc<RwLock<()>>) {
        self.memo.push(MemoSlot::TreeX(latch.write_arc()));
    }

    /// Mode of the tree latch held by this mtr, if any
    pub fn tree_latch(&self) -> Option<LatchKind> {
        self.memo.iter().find_map(|slot| match slot {
            MemoSlot::TreeS(_) => Some(LatchKind::Shared),
            MemoSlot::TreeX(_) => Some(LatchKind::Exclusive),
            _ => None,
        })
    }

    /// Release the tree latch early, keeping page latches
    pub fn release_tree_latch(&mut self) {
        for slot in self.memo.iter_mut() {
            if matches!(slot, MemoSlot::TreeS(_) | MemoSlot::TreeX(_)) {
                *slot = MemoSlot::Released;
            }
        }
    }

    // ---- savepoints ---------------------------------------------------------

    pub fn set_savepoint(&self) -> Savepoint {
        self.memo.len()
    }

    /// Release the latch or bufferfix acquired right at `savepoint`
    pub fn release_at_savepoint(&mut self, savepoint: Savepoint) {
        if let Some(slot) = self.memo.get_mut(savepoint) {
            if let MemoSlot::PageX(page_no, _) = slot {
                if self.log_buf.iter().any(|(p, _)| p == page_no) {
                    warn!("mtr: keeping latch on modified page {}", page_no);
                    return;
                }
            }
            if let MemoSlot::BufFix(frame) = slot {
                frame.unfix();
            }
            *slot = MemoSlot::Released;
        }
    }

    /// Release everything acquired since `savepoint`, tree latch included.
    /// Used to restart a descent before any page was modified.
    pub fn rollback_to_savepoint(&mut self, savepoint: Savepoint) {
        for i in (savepoint..self.memo.len()).rev() {
            self.release_at_savepoint(i);
        }
        while matches!(self.memo.last(), Some(MemoSlot::Released)) {
            self.memo.pop();
        }
    }

    /// Release every latch this mtr holds on `page_no` unless it was
    /// modified
    pub fn release_page(&mut self, page_no: PageNo) {
        let positions: Vec<usize> = self
            .memo
            .iter()
            .enumerate()
            .filter(|(_, slot)| match slot {
                MemoSlot::PageS(p, _) | MemoSlot::PageX(p, _) => *p == page_no,
                MemoSlot::BufFix(f) => f.page_no() == page_no,
                _ => false,
            })
            .map(|(i, _)| i)
            .collect();
        for i in positions {
            self.release_at_savepoint(i);
        }
    }

    // ---- page latches -------------------------------------------------------

    fn find_page(&self, page_no: PageNo) -> Option<LatchKind> {
        let mut found = None;
        for slot in &self.memo {
            match slot {
                MemoSlot::PageX(p, _) if *p == page_no => return Some(LatchKind::Exclusive),
                MemoSlot::PageS(p, _) if *p == page_no => found = Some(LatchKind::Shared),
                _ => {}
            }
        }
        found
    }

    pub fn is_latched(&self, page_no: PageNo) -> Option<LatchKind> {
        self.find_page(page_no)
    }

    /// Pin a page without latching it
    pub fn bufferfix(&mut self, page_no: PageNo) -> Result<()> {
        let frame = self.cache.get(page_no)?;
        frame.fix();
        self.memo.push(MemoSlot::BufFix(frame));
        Ok(())
    }

    /// Latch `page_no` in `kind` mode unless this mtr already holds a
    /// sufficient latch. Latches are never upgraded in place.
    pub fn latch(&mut self, page_no: PageNo, kind: LatchKind) -> Result<()> {
        match (self.find_page(page_no), kind) {
            (Some(LatchKind::Exclusive), _) | (Some(LatchKind::Shared), LatchKind::Shared) => {
                return Ok(())
            }
            (Some(LatchKind::Shared), LatchKind::Exclusive) => {
                return Err(StorageError::Lock(format!(
                    "latch upgrade requested on page {}",
                    page_no
                )))
            }
            (None, _) => {}
        }
        let frame = self.cache.get(page_no)?;
        let slot = match kind {
            LatchKind::Shared => MemoSlot::PageS(page_no, frame.latch().read_arc()),
            LatchKind::Exclusive => MemoSlot::PageX(page_no, frame.latch().write_arc()),
        };
        self.memo.push(slot);
        Ok(())
    }

    pub fn s_latch(&mut self, page_no: PageNo) -> Result<()> {
        self.latch(page_no, LatchKind::Shared)
    }

    pub fn x_latch(&mut self, page_no: PageNo) -> Result<()> {
        self.latch(page_no, LatchKind::Exclusive)
    }

    /// Adopt a guard acquired during latch coupling
    pub fn push_s_guard(&mut self, page_no: PageNo, guard: PageReadGuard) {
        self.memo.push(MemoSlot::PageS(page_no, guard));
    }

    pub fn push_x_guard(&mut self, page_no: PageNo, guard: PageWriteGuard) {
        self.memo.push(MemoSlot::PageX(page_no, guard));
    }

    /// Read access to a page latched by this mtr
    pub fn page(&self, page_no: PageNo) -> Result<&Page> {
        let mut shared = None;
        for slot in &self.memo {
            match slot {
                MemoSlot::PageX(p, guard) if *p == page_no => return Ok(&**guard),
                MemoSlot::PageS(p, guard) if *p == page_no => shared = Some(&**guard),
                _ => {}
            }
        }
        shared.ok_or_else(|| {
            StorageError::Lock(format!("page {} is not latched by this mtr", page_no))
        })
    }

    fn page_mut(&mut self, page_no: PageNo) -> Result<&mut Page> {
        for slot in self.memo.iter_mut() {
            if let MemoSlot::PageX(p, guard) = slot {
                if *p == page_no {
                    return Ok(&mut **guard);
                }
            }
        }
        Err(StorageError::Lock(format!(
            "page {} is not X-latched by this mtr",
            page_no
        )))
    }

    // ---- logged mutation ----------------------------------------------------

    /// Log and apply one page operation. The page must be X-latched; an
    /// operation that does not fit the page is an invariant violation and
    /// aborts with a page dump.
    pub fn apply(&mut self, page_no: PageNo, op: PageOp) -> Result<()> {
        let page = self.page_mut(page_no)?;
        if let Err(e) = page.apply(&op) {
            page.corrupted(&format!("{:?} failed: {}", op, e));
        }
        self.log_buf.push((page_no, op));
        Ok(())
    }

    /// Allocate and format a page; it is returned X-latched
    pub fn create_page(
        &mut self,
        reservation: &mut Reservation<'_>,
        index_id: u64,
        hint: Option<PageNo>,
        direction: AllocDirection,
        level: u16,
        compact: bool,
    ) -> Result<PageNo> {
        let frame = self
            .cache
            .alloc(reservation, index_id, hint, direction, level)?;
        let page_no = frame.page_no();
        self.push_x_guard(page_no, frame.latch().write_arc());
        self.apply(
            page_no,
            PageOp::Create {
                index_id,
                level,
                compact,
            },
        )?;
        Ok(page_no)
    }

    /// Reset an X-latched page; it returns to the free list at commit
    pub fn free_page(&mut self, index_id: u64, page_no: PageNo) -> Result<()> {
        self.apply(page_no, PageOp::Free)?;
        self.freed.push((index_id, page_no));
        Ok(())
    }

    pub fn is_modified(&self) -> bool {
        !self.log_buf.is_empty()
    }

    /// Write the redo frame, stamp page LSNs, release everything.
    /// Returns the LSN following this mtr's last record.
    pub fn commit(mut self) -> Result<Lsn> {
        let lsn = if self.log_buf.is_empty() {
            self.log.current_lsn()
        } else {
            let ops = std::mem::take(&mut self.log_buf);
            let pages: Vec<PageNo> = ops.iter().map(|(p, _)| *p).collect();
            let lsns = match self.log.append_mtr(ops) {
                Ok(lsns) => lsns,
                Err(e) => {
                    error!("mtr: redo append failed after changing {} pages: {}", pages.len(), e);
                    panic!("redo append failed after page changes: {}", e);
                }
            };
            for (page_no, lsn) in pages.iter().zip(&lsns) {
                self.page_mut(*page_no)?.set_lsn(*lsn);
            }
            lsns.last().map_or(self.log.current_lsn(), |l| l + 1)
        };
        self.committed = true;
        self.release_all();
        for (index_id, page_no) in std::mem::take(&mut self.freed) {
            self.cache.free(index_id, page_no);
        }
        Ok(lsn)
    }

    fn release_all(&mut self) {
        while let Some(slot) = self.memo.pop() {
            if let MemoSlot::BufFix(frame) = slot {
                frame.unfix();
            }
        }
    }
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        // Applied changes have no undo; they must reach the log
        if !self.committed && !self.log_buf.is_empty() && !std::thread::panicking() {
            let what = format!("mtr dropped with {} unlogged page changes", self.log_buf.len());
            let page_no = self.log_buf[0].0;
            if let Ok(page) = self.page(page_no) {
                page.corrupted(&what);
            }
            error!("{}", what);
            panic!("{}", what);
        }
        self.release_all();
    }
}
