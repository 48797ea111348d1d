//! Latched tree descent
//!
//! Every B-tree operation starts here: take the tree latch in the mode the
//! caller's intent needs, walk from the root to the target level and return
//! a positioned cursor with exactly the latches the intent requires.
//!
//! - Search / leaf-modify descents take the tree latch shared and couple
//!   shared page latches down the tree (child latched before the parent is
//!   released). Only the target page stays latched; the tree latch is
//!   released before returning.
//! - Tree-modify descents take the tree latch exclusive. A non-leaf page is
//!   X-latched and kept only if the pending leaf change could restructure
//!   it; otherwise it is merely bufferfixed. At the leaf, the left sibling,
//!   the page and the right sibling are X-latched in that order.
//! - Continue-modify descents run inside a tree-modify operation that
//!   already holds the tree latch; they X-latch the target page only.

use log::{debug, error};

use super::page_cur::{self, PageCursor, SearchMode};
use super::BTree;
use crate::config::BTreeConfig;
use crate::record::Tuple;
use crate::storage::{Page, PageNo, FIL_NULL};
use crate::txn::{LatchKind, Mtr};
use crate::{Result, StorageError};

/// Latch intent of a descent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// S-latch the target page
    SearchLeaf,
    /// X-latch the target page
    ModifyLeaf,
    /// Exclusive tree latch, X on the target page and its siblings
    ModifyTree,
    /// Inside a tree-modify operation; X on the target page
    ContModifyTree,
    /// S-latch the left sibling, then the target page
    SearchPrev,
    /// X-latch the left sibling, then the target page
    ModifyPrev,
}

impl LatchMode {
    fn couples_shared(self) -> bool {
        matches!(
            self,
            LatchMode::SearchLeaf | LatchMode::ModifyLeaf | LatchMode::SearchPrev | LatchMode::ModifyPrev
        )
    }
}

/// What the caller may do to the tree once positioned; tunes which
/// ancestors a tree-modify descent keeps latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intention {
    Delete,
    Insert,
    Both,
}

/// Position within the tree after a descent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrCursor {
    pub page_no: PageNo,
    /// Page rank: 0 infimum, 1..=n_recs records, n_recs + 1 supremum
    pub pos: usize,
    pub up_match: usize,
    pub low_match: usize,
    pub level: u16,
    /// Level of the root at the time of the descent
    pub tree_height: u16,
    /// Left sibling latched by a *Prev descent
    pub left_page_no: PageNo,
    /// The descent was restarted with intention `Both`
    pub restarted: bool,
}

impl BtrCursor {
    /// Positioned on a record whose first `n_uniq` fields equal the search
    /// tuple (valid for `LessOrEqual` searches)
    pub fn is_exact(&self, n_uniq: usize) -> bool {
        self.pos > 0 && self.low_match >= n_uniq
    }
}

/// How the branch is chosen on each page
#[derive(Clone, Copy)]
pub(crate) enum Probe<'t> {
    Key(&'t Tuple, SearchMode),
    /// Leftmost (`true`) or rightmost branch
    Side(bool),
}

enum Descent {
    Done(BtrCursor),
    Restart,
}

/// Run `f` on a page: through the mtr if it already latched the page,
/// otherwise under a transient shared latch.
pub(crate) fn peek<R>(mtr: &Mtr<'_>, page_no: PageNo, f: impl FnOnce(&Page) -> R) -> Result<R> {
    if mtr.is_latched(page_no).is_some() {
        return Ok(f(mtr.page(page_no)?));
    }
    let frame = mtr.cache().get(page_no)?;
    let guard = frame.latch().read();
    Ok(f(&guard))
}

/// Dump the involved pages and abort. Used when tree invariants are found
/// broken while a mini-transaction may already have changed pages.
pub(crate) fn fatal(mtr: &Mtr<'_>, pages: &[PageNo], what: &str) -> ! {
    for &page_no in pages {
        match mtr.page(page_no) {
            Ok(page) => error!("{:?}", page),
            Err(_) => {
                if let Ok(frame) = mtr.cache().get(page_no) {
                    if let Some(page) = frame.latch().try_read() {
                        error!("{:?}", *page);
                    }
                }
            }
        }
    }
    error!("B-tree corruption: {}", what);
    panic!("B-tree corruption: {}", what);
}

/// Could a change below `page` force a split or merge of `page` itself?
pub fn will_cause_restructure(config: &BTreeConfig, page: &Page, intention: Intention) -> bool {
    let may_delete = matches!(intention, Intention::Delete | Intention::Both);
    let may_insert = matches!(intention, Intention::Insert | Intention::Both);
    if may_delete
        && (page.n_recs() <= 2
            || page.data_size() < config.merge_threshold_bytes() + config.merge_margin_bytes)
    {
        return true;
    }
    may_insert && page.max_insert_size_after_reorganize(2) < config.split_margin_bytes
}

fn branch(page: &Page, probe: Probe<'_>) -> (PageCursor, PageNo) {
    let n = page.n_recs();
    if n == 0 {
        page.corrupted("empty non-leaf page on the search path");
    }
    let pc = match probe {
        Probe::Key(tuple, mode) => page_cur::search(page, tuple, mode.for_upper_levels()),
        Probe::Side(true) => PageCursor { pos: 1, ..Default::default() },
        Probe::Side(false) => PageCursor { pos: n, ..Default::default() },
    };
    if pc.pos == 0 || pc.pos > n {
        page.corrupted(&format!("node pointer search ended at position {}", pc.pos));
    }
    (pc, page.rec(pc.pos).child_page_no())
}

fn position(page: &Page, probe: Probe<'_>) -> PageCursor {
    match probe {
        Probe::Key(tuple, mode) => page_cur::search(page, tuple, mode),
        Probe::Side(true) => PageCursor::default(),
        Probe::Side(false) => PageCursor {
            pos: page.n_recs() + 1,
            ..Default::default()
        },
    }
}

/// Latch the target page per `latch_mode` and position on it
fn latch_target(
    mtr: &mut Mtr<'_>,
    page_no: PageNo,
    level: u16,
    probe: Probe<'_>,
    latch_mode: LatchMode,
) -> Result<(PageCursor, PageNo)> {
    let mut left = FIL_NULL;
    match latch_mode {
        LatchMode::SearchLeaf => {
            let guard = mtr.cache().get(page_no)?.latch().read_arc();
            mtr.push_s_guard(page_no, guard);
        }
        LatchMode::ModifyLeaf => {
            let guard = mtr.cache().get(page_no)?.latch().write_arc();
            mtr.push_x_guard(page_no, guard);
        }
        LatchMode::SearchPrev | LatchMode::ModifyPrev => {
            let kind = if latch_mode == LatchMode::SearchPrev {
                LatchKind::Shared
            } else {
                LatchKind::Exclusive
            };
            left = peek(mtr, page_no, |p| p.prev())?;
            if left != FIL_NULL {
                mtr.latch(left, kind)?;
            }
            mtr.latch(page_no, kind)?;
            if mtr.page(page_no)?.prev() != left {
                fatal(mtr, &[left, page_no], "left sibling changed under the tree latch");
            }
        }
        LatchMode::ModifyTree if level == 0 => {
            let (prev, next) = peek(mtr, page_no, |p| (p.prev(), p.next()))?;
            if prev != FIL_NULL {
                mtr.x_latch(prev)?;
            }
            mtr.x_latch(page_no)?;
            if next != FIL_NULL {
                mtr.x_latch(next)?;
            }
            left = prev;
        }
        LatchMode::ModifyTree | LatchMode::ContModifyTree => mtr.x_latch(page_no)?,
    }
    let pc = position(mtr.page(page_no)?, probe);
    Ok((pc, left))
}

fn descend(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    level: u16,
    probe: Probe<'_>,
    latch_mode: LatchMode,
    intention: Intention,
) -> Result<Descent> {
    match latch_mode {
        LatchMode::ModifyTree => mtr.x_lock_tree(tree.latch()),
        LatchMode::ContModifyTree => {
            if mtr.tree_latch() != Some(LatchKind::Exclusive) {
                return Err(StorageError::Lock(
                    "continue-modify descent without the exclusive tree latch".into(),
                ));
            }
        }
        _ => mtr.s_lock_tree(tree.latch()),
    }

    let root = tree.root_page_no();
    let height = peek(mtr, root, |p| p.level())?;
    if level > height {
        return Err(StorageError::Index(format!(
            "level {} above root level {}",
            level, height
        )));
    }

    let mut page_no = root;
    let mut cur_level = height;
    let mut parent = None;
    loop {
        if cur_level == level {
            let (pc, left) = latch_target(mtr, page_no, level, probe, latch_mode)?;
            drop(parent);
            if latch_mode.couples_shared() {
                mtr.release_tree_latch();
            }
            return Ok(Descent::Done(BtrCursor {
                page_no,
                pos: pc.pos,
                up_match: pc.up_match,
                low_match: pc.low_match,
                level,
                tree_height: height,
                left_page_no: left,
                restarted: false,
            }));
        }

        let ((pc, child), n_recs) = if latch_mode.couples_shared() {
            let guard = mtr.cache().get(page_no)?.latch().read_arc();
            let found = (branch(&guard, probe), guard.n_recs());
            // The child is latched on the next iteration before this
            // guard is replaced
            parent = Some(guard);
            found
        } else {
            if latch_mode == LatchMode::ModifyTree && mtr.is_latched(page_no).is_none() {
                let restructure =
                    peek(mtr, page_no, |p| will_cause_restructure(tree.config(), p, intention))?;
                if restructure {
                    mtr.x_latch(page_no)?;
                } else {
                    mtr.bufferfix(page_no)?;
                }
            }
            peek(mtr, page_no, |p| (branch(p, probe), p.n_recs()))?
        };

        if latch_mode == LatchMode::ModifyTree
            && intention == Intention::Delete
            && page_no != root
            && (pc.pos == 1 || pc.pos == n_recs)
        {
            // Removing the child could change this page's first or last
            // node pointer, which propagates upward
            return Ok(Descent::Restart);
        }

        page_no = child;
        cur_level -= 1;
    }
}

/// Position a cursor on `level` for `tuple` in `mode`, latching per
/// `latch_mode`.
pub fn search_to_nth_level(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    level: u16,
    tuple: &Tuple,
    mode: SearchMode,
    latch_mode: LatchMode,
    intention: Intention,
) -> Result<BtrCursor> {
    let mut intention = intention;
    let mut restarted = false;
    loop {
        let savepoint = mtr.set_savepoint();
        match descend(tree, mtr, level, Probe::Key(tuple, mode), latch_mode, intention)? {
            Descent::Done(mut cursor) => {
                cursor.restarted = restarted;
                return Ok(cursor);
            }
            Descent::Restart => {
                debug!(
                    "index {}: delete descent restarted with intention Both",
                    tree.index().index_id
                );
                mtr.rollback_to_savepoint(savepoint);
                intention = Intention::Both;
                restarted = true;
            }
        }
    }
}

/// Position before the first (`from_left`) or after the last record of
/// `level`.
pub fn open_at_index_side(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    from_left: bool,
    level: u16,
    latch_mode: LatchMode,
) -> Result<BtrCursor> {
    match descend(tree, mtr, level, Probe::Side(from_left), latch_mode, Intention::Both)? {
        Descent::Done(cursor) => Ok(cursor),
        Descent::Restart => unreachable!("side descents never restart"),
    }
}

/// Locate the node pointer to `page_no` one level up, X-latching the
/// father page. The caller holds the tree latch exclusive. A pointer that
/// does not name `page_no` is fatal corruption.
pub fn page_father(tree: &BTree, mtr: &mut Mtr<'_>, page_no: PageNo) -> Result<BtrCursor> {
    let n_uniq = tree.index().n_uniq;
    let (level, prev, key) = peek(mtr, page_no, |p| {
        (p.level(), p.prev(), p.first_rec().map(|r| r.copy_prefix(n_uniq)))
    })?;
    if page_no == tree.root_page_no() {
        fatal(mtr, &[page_no], "father requested for the root page");
    }

    let cursor = if prev == FIL_NULL {
        // Leftmost on its level: the father pointer is the leftmost one
        let mut cursor = open_at_index_side(tree, mtr, true, level + 1, LatchMode::ContModifyTree)?;
        cursor.pos = 1;
        cursor
    } else {
        let Some(key) = key else {
            fatal(mtr, &[page_no], "father requested for an empty non-leftmost page");
        };
        search_to_nth_level(
            tree,
            mtr,
            level + 1,
            &key,
            SearchMode::LessOrEqual,
            LatchMode::ContModifyTree,
            Intention::Both,
        )?
    };

    let child = peek(mtr, cursor.page_no, |p| {
        (cursor.pos >= 1 && cursor.pos <= p.n_recs()).then(|| p.rec(cursor.pos).child_page_no())
    })?;
    if child != Some(page_no) {
        fatal(
            mtr,
            &[cursor.page_no, page_no],
            &format!(
                "node pointer at page {} position {} names child {:?}, expected {}",
                cursor.page_no, cursor.pos, child, page_no
            ),
        );
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::space::Space;
    use crate::record::IndexDesc;

    fn two_level_tree() -> BTree {
        let config = BTreeConfig::for_testing();
        let space = Space::new(1, &config).unwrap();
        let tree = BTree::create(space, IndexDesc::new(11, 1, 2), config).unwrap();
        for k in 0..1500u64 {
            tree.insert(&Tuple::with_payload(k, &[3u8; 40])).unwrap();
        }
        assert_eq!(tree.height().unwrap(), 2);
        tree
    }

    fn descent(tree: &BTree, k: u64, intention: Intention) -> BtrCursor {
        let mut mtr = tree.start_mtr();
        let cursor = search_to_nth_level(
            tree,
            &mut mtr,
            0,
            &Tuple::from_u64(k),
            SearchMode::LessOrEqual,
            LatchMode::ModifyTree,
            intention,
        )
        .unwrap();
        mtr.commit().unwrap();
        cursor
    }

    /// A key reached through a node pointer in the middle of the leftmost
    /// level-1 page
    fn inner_key(tree: &BTree) -> u64 {
        let mut mtr = tree.start_mtr();
        mtr.s_lock_tree(tree.latch());
        let branch = peek(&mtr, tree.root_page_no(), |p| p.rec(1).child_page_no()).unwrap();
        let (n, leaf) = peek(&mtr, branch, |p| (p.n_recs(), p.rec(p.n_recs() / 2).child_page_no())).unwrap();
        assert!(n >= 3);
        let k = peek(&mtr, leaf, |p| p.rec(2).to_tuple().key_u64().unwrap()).unwrap();
        mtr.commit().unwrap();
        k
    }

    #[test]
    fn test_delete_descent_restarts_on_boundary_pointer() {
        let tree = two_level_tree();
        // Key 0 goes through the first node pointer of a non-root page
        let cursor = descent(&tree, 0, Intention::Delete);
        assert!(cursor.restarted);
        assert!(cursor.is_exact(1));
        assert!(!descent(&tree, 0, Intention::Insert).restarted);

        let k = inner_key(&tree);
        let cursor = descent(&tree, k, Intention::Delete);
        assert!(!cursor.restarted);
        assert!(cursor.is_exact(1));
    }

    #[test]
    fn test_restructure_margins() {
        let config = BTreeConfig::for_testing();
        let mut page = Page::new(5, config.page_size);
        page.apply(&crate::storage::PageOp::Create { index_id: 1, level: 1, compact: true })
            .unwrap();
        // An empty page can absorb any insert but would underflow on delete
        assert!(!will_cause_restructure(&config, &page, Intention::Insert));
        assert!(will_cause_restructure(&config, &page, Intention::Delete));
    }
}
