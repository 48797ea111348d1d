//! Page split and root raise
//!
//! ## Split point
//! A split divides the page's records plus the tuple being inserted into a
//! lower and an upper half. The split point names the first element of the
//! upper half: either an existing record or the tuple itself.
//!
//! - Ascending inserts (the previous insert landed right before the
//!   insertion point): keep one record after the insertion point on the
//!   old page and move the rest to a new page on the right.
//! - Descending inserts: symmetric, the new page goes to the left.
//! - Otherwise split by byte volume so both halves are guaranteed to fit.
//!
//! ## Split sequence
//! ```text
//! allocate -> attach (father pointers, sibling links) -> [release tree latch]
//!          -> move records -> insert tuple -> (no fit: split the half again)
//! ```

use std::sync::atomic::Ordering;

use log::debug;

use super::cursor::{fatal, page_father, search_to_nth_level, BtrCursor, Intention, LatchMode};
use super::insert::{insert_rec_on_page, pessimistic_insert};
use super::page_cur::SearchMode;
use super::BTree;
use crate::record::{build_node_pointer, Tuple, REC_INFO_MIN_REC};
use crate::storage::{AllocDirection, Page, PageNo, PageOp, Reservation, FIL_NULL, SLOT_SIZE};
use crate::txn::Mtr;
use crate::Result;

/// A split that still leaves the tuple without room is retried once on the
/// half the tuple belongs to.
const MAX_SPLIT_ATTEMPTS: usize = 2;

/// First element of the upper half
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPoint {
    /// The tuple being inserted
    Tuple,
    /// The record at this position
    Rec(usize),
}

impl SplitPoint {
    /// Position of the first record that moves to the upper half
    fn split_pos(self, pos: usize) -> usize {
        match self {
            SplitPoint::Tuple => pos + 1,
            SplitPoint::Rec(s) => s,
        }
    }

    /// Does the tuple (inserted after `pos`) land in the lower half?
    fn insert_left(self, pos: usize) -> bool {
        match self {
            SplitPoint::Tuple => false,
            SplitPoint::Rec(s) => pos < s,
        }
    }
}

/// Ascending-insert heuristic
pub fn split_rec_to_right(page: &Page, pos: usize) -> Option<SplitPoint> {
    let last = page.last_insert();
    if last == 0 || last != pos {
        return None;
    }
    if pos + 2 > page.n_recs() {
        Some(SplitPoint::Tuple)
    } else {
        Some(SplitPoint::Rec(pos + 2))
    }
}

/// Descending-insert heuristic
pub fn split_rec_to_left(page: &Page, pos: usize) -> Option<SplitPoint> {
    let last = page.last_insert();
    if last == 0 || last != pos + 1 {
        return None;
    }
    // Converging in the middle of the page: the record before the insertion
    // point goes up with the tuple
    if pos > 1 {
        Some(SplitPoint::Rec(pos))
    } else {
        Some(SplitPoint::Rec(pos + 1))
    }
}

/// Split point by byte volume over the page records with the tuple placed
/// after `pos`. Records are included into the lower half until it holds
/// half of the total; if that half fits an empty page, the next element
/// starts the upper half.
pub fn sure_split_rec(page: &Page, pos: usize, tuple_size: usize) -> SplitPoint {
    let n = page.n_recs();
    let free = Page::free_space_of_empty(page.page_size());
    let total = page.data_size() + tuple_size + SLOT_SIZE * (n + 1);

    // Element i of the virtual sequence of n + 1 entries
    let size_of = |i: usize| {
        if i == pos + 1 {
            tuple_size
        } else if i <= pos {
            page.rec(i).size()
        } else {
            page.rec(i - 1).size()
        }
    };
    let to_split_point = |i: usize| {
        if i == pos + 1 {
            SplitPoint::Tuple
        } else if i <= pos {
            SplitPoint::Rec(i)
        } else {
            SplitPoint::Rec(i - 1)
        }
    };

    let mut included = 0;
    for i in 1..=n + 1 {
        included += size_of(i);
        let used = included + SLOT_SIZE * i;
        if used >= total / 2 {
            let first_upper = if used <= free && i <= n { i + 1 } else { i };
            return to_split_point(first_upper);
        }
    }
    to_split_point(n + 1)
}

/// Will the tuple fit the half it lands in, once the records of the other
/// half are gone?
pub fn insert_fits_after_split(page: &Page, split: SplitPoint, pos: usize, tuple_size: usize) -> bool {
    let n = page.n_recs();
    let free = Page::free_space_of_empty(page.page_size());
    // Records that end up on the other half, [from, to)
    let (from, to) = match split {
        SplitPoint::Tuple => (1, pos + 1),
        SplitPoint::Rec(s) if s <= pos => (1, s),
        SplitPoint::Rec(s) => (s, n + 1),
    };

    let mut data = page.data_size() + tuple_size;
    let mut n_recs = n + 1;
    if data + SLOT_SIZE * n_recs <= free {
        return true;
    }
    for p in from..to {
        data -= page.rec(p).size();
        n_recs -= 1;
        if data + SLOT_SIZE * n_recs <= free {
            return true;
        }
    }
    false
}

fn choose_split(page: &Page, pos: usize, tuple_size: usize, attempt: usize) -> (SplitPoint, AllocDirection) {
    if attempt == 0 {
        let heuristic = split_rec_to_right(page, pos)
            .map(|s| (s, AllocDirection::Up))
            .or_else(|| split_rec_to_left(page, pos).map(|s| (s, AllocDirection::Down)));
        if let Some((split, direction)) = heuristic {
            if insert_fits_after_split(page, split, pos, tuple_size) {
                return (split, direction);
            }
        }
    }
    (sure_split_rec(page, pos, tuple_size), AllocDirection::Up)
}

/// Point the node pointer at `at` to `child`, keeping its key and info bits
pub(crate) fn set_node_ptr_child(mtr: &mut Mtr<'_>, at: &BtrCursor, child: PageNo) -> Result<()> {
    let rec = {
        let page = mtr.page(at.page_no)?;
        let mut node_ptr = page.rec(at.pos).to_tuple();
        if let Some(last) = node_ptr.fields.last_mut() {
            *last = child.to_be_bytes().to_vec();
        }
        node_ptr.encode(page.row_format())?
    };
    mtr.apply(
        at.page_no,
        PageOp::UpdateInPlace {
            pos: at.pos as u16,
            rec,
        },
    )
}

/// Insert a node pointer on `level`, splitting there if needed
pub(crate) fn insert_on_non_leaf_level(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    level: u16,
    node_ptr: &Tuple,
) -> Result<()> {
    let cursor = search_to_nth_level(
        tree,
        mtr,
        level,
        node_ptr,
        SearchMode::LessOrEqual,
        LatchMode::ContModifyTree,
        Intention::Both,
    )?;
    let rec = node_ptr.encode(tree.index().row_format)?;
    if !insert_rec_on_page(tree, mtr, cursor.page_no, cursor.pos, &rec, true)? {
        pessimistic_insert(tree, mtr, res, &cursor, node_ptr, false)?;
    }
    Ok(())
}

/// Hook `new_page_no` into the tree next to `page_no`: father pointers one
/// level up, then the sibling links of the level.
pub(crate) fn attach_half_pages(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    page_no: PageNo,
    new_page_no: PageNo,
    direction: AllocDirection,
    upper_first: &Tuple,
) -> Result<()> {
    let (level, prev, next) = {
        let page = mtr.page(page_no)?;
        (page.level(), page.prev(), page.next())
    };

    let (lower, upper) = if direction == AllocDirection::Down {
        // The father pointer of the page now leads to the new lower half
        let father = page_father(tree, mtr, page_no)?;
        set_node_ptr_child(mtr, &father, new_page_no)?;
        (new_page_no, page_no)
    } else {
        (page_no, new_page_no)
    };

    let node_ptr = build_node_pointer(tree.index(), upper_first, upper);
    insert_on_non_leaf_level(tree, mtr, res, level + 1, &node_ptr)?;

    if direction == AllocDirection::Down {
        if prev != FIL_NULL {
            mtr.x_latch(prev)?;
            mtr.apply(prev, PageOp::SetNext(lower))?;
        }
        mtr.apply(lower, PageOp::SetPrev(prev))?;
    } else {
        if next != FIL_NULL {
            mtr.x_latch(next)?;
            mtr.apply(next, PageOp::SetPrev(upper))?;
        }
        mtr.apply(upper, PageOp::SetNext(next))?;
    }
    mtr.apply(lower, PageOp::SetNext(upper))?;
    mtr.apply(upper, PageOp::SetPrev(lower))?;
    Ok(())
}

/// Move the records that belong to the new page off `page_no`
fn move_half(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    page_no: PageNo,
    new_page_no: PageNo,
    direction: AllocDirection,
    split_pos: usize,
) -> Result<()> {
    let (level, n_recs) = {
        let page = mtr.page(page_no)?;
        (page.level(), page.n_recs())
    };
    let (from, to) = match direction {
        AllocDirection::Down => (1, split_pos),
        _ => (split_pos, n_recs + 1),
    };
    if from >= to {
        return Ok(());
    }

    tree.space().ahi().drop_page_hash_index(page_no);
    let (recs, keys) = {
        let page = mtr.page(page_no)?;
        let recs: Vec<Vec<u8>> = (from..to).map(|p| page.rec(p).as_bytes().to_vec()).collect();
        let keys = if level == 0 {
            (from..to)
                .map(|p| tree.rec_key(&page.rec(p)))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        (recs, keys)
    };
    mtr.apply(new_page_no, PageOp::InsertList { after: 0, recs })?;
    mtr.apply(
        page_no,
        PageOp::DeleteRange {
            from: from as u16,
            to: to as u16,
        },
    )?;

    if level == 0 {
        let locks = tree.space().locks();
        match direction {
            AllocDirection::Down => locks.update_split_left(page_no, new_page_no, &keys),
            _ => locks.update_split_right(new_page_no, page_no, &keys),
        }
    }
    Ok(())
}

/// Split the page under `cursor` and insert `tuple` after `cursor.pos`.
/// The caller holds the tree latch exclusive and has reserved pages.
/// Returns the page and position of the inserted record.
pub(crate) fn split_and_insert(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    cursor: &BtrCursor,
    tuple: &Tuple,
    allow_early_release: bool,
) -> Result<(PageNo, usize)> {
    let index = tree.index();
    let rec = tuple.encode(index.row_format)?;
    let mut page_no = cursor.page_no;
    let mut pos = cursor.pos;
    let mut released = false;

    for attempt in 0..MAX_SPLIT_ATTEMPTS {
        let (level, split, direction, fits) = {
            let page = mtr.page(page_no)?;
            let (split, direction) = choose_split(page, pos, rec.len(), attempt);
            let fits = insert_fits_after_split(page, split, pos, rec.len());
            (page.level(), split, direction, fits)
        };
        let split_pos = split.split_pos(pos);
        let insert_left = split.insert_left(pos);
        let upper_first = match split {
            SplitPoint::Tuple => tuple.clone(),
            SplitPoint::Rec(s) => mtr.page(page_no)?.rec(s).to_tuple(),
        };

        let new_page_no = mtr.create_page(
            res,
            index.index_id,
            Some(page_no),
            direction,
            level,
            index.is_compact(),
        )?;
        attach_half_pages(tree, mtr, res, page_no, new_page_no, direction, &upper_first)?;
        tree.counters.splits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "index {}: split page {} at {:?} ({:?}), new page {}, level {}",
            index.index_id, page_no, split, direction, new_page_no, level
        );

        // Upper levels are consistent again and the tuple is known to fit
        if allow_early_release && level == 0 && attempt == 0 && fits {
            mtr.release_tree_latch();
            released = true;
        }

        move_half(tree, mtr, page_no, new_page_no, direction, split_pos)?;

        let (target, after) = match (direction, insert_left) {
            (AllocDirection::Down, true) => (new_page_no, pos),
            (AllocDirection::Down, false) => (page_no, pos + 1 - split_pos),
            (_, true) => (page_no, pos),
            (_, false) => (new_page_no, pos + 1 - split_pos),
        };
        if insert_rec_on_page(tree, mtr, target, after, &rec, true)? {
            return Ok((target, after + 1));
        }
        if released {
            fatal(mtr, &[page_no, new_page_no], "insert failed after the tree latch was released");
        }
        debug!(
            "index {}: tuple of {} bytes still does not fit page {}, splitting again",
            index.index_id,
            rec.len(),
            target
        );
        page_no = target;
        pos = after;
    }
    fatal(mtr, &[page_no], "insert does not fit after repeated splits")
}

/// Grow the tree by one level: move the root's records to a new child,
/// leave a single minimum-record node pointer in the root and split the
/// child.
pub(crate) fn root_raise_and_insert(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    cursor: &BtrCursor,
    tuple: &Tuple,
    allow_early_release: bool,
) -> Result<(PageNo, usize)> {
    let index = tree.index();
    let root = tree.root_page_no();
    let (level, recs, first) = {
        let page = mtr.page(root)?;
        let recs: Vec<Vec<u8>> = (1..=page.n_recs())
            .map(|p| page.rec(p).as_bytes().to_vec())
            .collect();
        (page.level(), recs, page.first_rec().map(|r| r.to_tuple()))
    };
    let Some(first) = first else {
        fatal(mtr, &[root], "root raise of an empty root");
    };

    let new_page_no = mtr.create_page(
        res,
        index.index_id,
        None,
        AllocDirection::NoDirection,
        level,
        index.is_compact(),
    )?;
    mtr.apply(new_page_no, PageOp::InsertList { after: 0, recs })?;
    if level == 0 {
        tree.space().locks().update_root_raise(new_page_no, root);
    }

    tree.space().ahi().drop_page_hash_index(root);
    mtr.apply(root, PageOp::Empty { level: level + 1 })?;
    tree.space()
        .cache()
        .set_segment(index.index_id, root, level + 1);

    let mut node_ptr = build_node_pointer(index, &first, new_page_no);
    node_ptr.info_bits |= REC_INFO_MIN_REC;
    mtr.apply(
        root,
        PageOp::InsertRec {
            after: 0,
            rec: node_ptr.encode(index.row_format)?,
        },
    )?;
    tree.counters.root_raises.fetch_add(1, Ordering::Relaxed);
    debug!(
        "index {}: root raised to level {}, records moved to page {}",
        index.index_id,
        level + 1,
        new_page_no
    );

    let child = BtrCursor {
        page_no: new_page_no,
        level,
        tree_height: level + 1,
        ..cursor.clone()
    };
    split_and_insert(tree, mtr, res, &child, tuple, allow_early_release)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RowFormat;

    fn leaf_with(n: u64) -> Page {
        let mut page = Page::new(1, 1024);
        page.apply(&PageOp::Create {
            index_id: 1,
            level: 0,
            compact: true,
        })
        .unwrap();
        let recs = (0..n)
            .map(|k| Tuple::with_payload(k * 10, &[0u8; 40]).encode(RowFormat::Compact).unwrap())
            .collect();
        page.apply(&PageOp::InsertList { after: 0, recs }).unwrap();
        page
    }

    fn rec_size() -> usize {
        Tuple::with_payload(0, &[0u8; 40])
            .encode(RowFormat::Compact)
            .unwrap()
            .len()
    }

    #[test]
    fn test_right_heuristic_after_ascending_insert() {
        let mut page = leaf_with(6);
        let rec = Tuple::with_payload(55, &[0u8; 40]).encode(RowFormat::Compact).unwrap();
        page.apply(&PageOp::InsertRec { after: 6, rec }).unwrap();
        assert_eq!(page.last_insert(), 7);

        // Next ascending insert lands after position 7, the last record
        assert_eq!(split_rec_to_right(&page, 7), Some(SplitPoint::Tuple));
        assert_eq!(split_rec_to_right(&page, 3), None);
        assert_eq!(split_rec_to_left(&page, 7), None);
    }

    #[test]
    fn test_right_heuristic_keeps_one_record_in_the_middle() {
        let mut page = leaf_with(6);
        let rec = Tuple::with_payload(25, &[0u8; 40]).encode(RowFormat::Compact).unwrap();
        page.apply(&PageOp::InsertRec { after: 3, rec }).unwrap();
        assert_eq!(split_rec_to_right(&page, 4), Some(SplitPoint::Rec(6)));
    }

    #[test]
    fn test_left_heuristic_after_descending_insert() {
        let mut page = leaf_with(6);
        let rec = Tuple::with_payload(25, &[0u8; 40]).encode(RowFormat::Compact).unwrap();
        page.apply(&PageOp::InsertRec { after: 3, rec }).unwrap();
        assert_eq!(page.last_insert(), 4);
        assert_eq!(split_rec_to_left(&page, 3), Some(SplitPoint::Rec(3)));

        let mut page = leaf_with(6);
        let rec = Tuple::with_payload(5, &[0u8; 40]).encode(RowFormat::Compact).unwrap();
        page.apply(&PageOp::InsertRec { after: 1, rec }).unwrap();
        assert_eq!(split_rec_to_left(&page, 1), Some(SplitPoint::Rec(2)));
    }

    #[test]
    fn test_sure_split_balances_halves() {
        let page = leaf_with(10);
        match sure_split_rec(&page, 10, rec_size()) {
            SplitPoint::Rec(s) => assert!((5..=7).contains(&s), "split at {}", s),
            SplitPoint::Tuple => panic!("expected a record split point"),
        }
        match sure_split_rec(&page, 0, rec_size()) {
            SplitPoint::Rec(s) => assert!((4..=6).contains(&s), "split at {}", s),
            SplitPoint::Tuple => panic!("expected a record split point"),
        }
    }

    #[test]
    fn test_sure_split_result_fits() {
        let mut page = leaf_with(0);
        let mut n = 0u16;
        loop {
            let rec = Tuple::with_payload(n as u64, &[0u8; 40]).encode(RowFormat::Compact).unwrap();
            if page.apply(&PageOp::InsertRec { after: n, rec }).is_err() {
                break;
            }
            n += 1;
        }
        for pos in [0, 1, n as usize / 2, n as usize] {
            let split = sure_split_rec(&page, pos, rec_size());
            assert!(insert_fits_after_split(&page, split, pos, rec_size()));
        }
    }

    #[test]
    fn test_fits_check_rejects_crowded_half() {
        let mut page = leaf_with(0);
        let mut n = 0u16;
        loop {
            let rec = Tuple::with_payload(n as u64, &[0u8; 40]).encode(RowFormat::Compact).unwrap();
            if page.apply(&PageOp::InsertRec { after: n, rec }).is_err() {
                break;
            }
            n += 1;
        }
        // Moving only the last record away leaves the lower half full
        let big = Page::max_rec_size(1024);
        assert!(!insert_fits_after_split(&page, SplitPoint::Rec(n as usize), 1, big));
        assert!(insert_fits_after_split(&page, SplitPoint::Rec(2), 1, big));
    }
}
