//! Insert state machine
//!
//! ```text
//! leaf optimistic --(no room)--> tree-modify descent --(still no room)-->
//!     split_and_insert                 (page is not the root)
//!     root_raise_and_insert            (page is the root)
//! ```
//!
//! The optimistic pass only X-latches the leaf. The pessimistic pass takes
//! the tree latch exclusive, reserves every page the split chain could need
//! and only then modifies anything.

use std::sync::atomic::Ordering;

use log::debug;

use super::cursor::{search_to_nth_level, BtrCursor, Intention, LatchMode};
use super::page_cur::SearchMode;
use super::split::{root_raise_and_insert, split_and_insert};
use super::BTree;
use crate::record::{converted_size, Tuple, REC_INFO_MIN_REC};
use crate::storage::{Page, PageNo, PageOp, Reservation, SLOT_SIZE};
use crate::txn::Mtr;
use crate::{Result, StorageError};

/// Pages a structural change may allocate: every level can split twice on
/// the way up, plus one page for a root raise.
pub(crate) fn structural_reservation(tree_height: u16) -> usize {
    2 * (tree_height as usize + 1) + 1
}

/// Validate a user tuple against the index and make it a search tuple on
/// the unique prefix
pub(crate) fn prepare_tuple(tree: &BTree, tuple: &Tuple) -> Result<Tuple> {
    let index = tree.index();
    if tuple.n_fields() != index.n_fields {
        return Err(StorageError::InvalidArgument(format!(
            "index {} expects {} fields, tuple has {}",
            index.index_id,
            index.n_fields,
            tuple.n_fields()
        )));
    }
    let size = converted_size(tuple, index.row_format);
    let max = Page::max_rec_size(tree.config().page_size);
    if size > max {
        return Err(StorageError::RecordTooBig { size, max });
    }
    let mut tuple = tuple.clone();
    tuple.n_fields_cmp = index.n_uniq;
    tuple.info_bits &= !REC_INFO_MIN_REC;
    Ok(tuple)
}

/// Defragment a page in place
pub(crate) fn reorganize_page(tree: &BTree, mtr: &mut Mtr<'_>, page_no: PageNo) -> Result<()> {
    let is_leaf = mtr.page(page_no)?.is_leaf();
    tree.space().ahi().drop_page_hash_index(page_no);
    mtr.apply(page_no, PageOp::Reorganize)?;
    if is_leaf {
        tree.space().locks().move_reorganize_page(page_no);
    }
    tree.counters.reorganizes.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Insert an encoded record after `after` if it fits, reorganizing the
/// page first when that makes room. Returns whether it was inserted.
pub(crate) fn insert_rec_on_page(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    page_no: PageNo,
    after: usize,
    rec: &[u8],
    allow_reorganize: bool,
) -> Result<bool> {
    let (fits, fits_reorganized) = {
        let page = mtr.page(page_no)?;
        (
            rec.len() + SLOT_SIZE <= page.free_space(),
            rec.len() <= page.max_insert_size_after_reorganize(1),
        )
    };
    if !fits {
        if !(allow_reorganize && fits_reorganized) {
            return Ok(false);
        }
        reorganize_page(tree, mtr, page_no)?;
    }
    mtr.apply(
        page_no,
        PageOp::InsertRec {
            after: after as u16,
            rec: rec.to_vec(),
        },
    )?;
    Ok(true)
}

/// Insert into the latched page under `cursor` without changing the tree
/// structure. `None` means the page has no room.
pub(crate) fn optimistic_insert(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    cursor: &BtrCursor,
    tuple: &Tuple,
) -> Result<Option<(PageNo, usize)>> {
    let rec = tuple.encode(tree.index().row_format)?;
    let reorganize = tree.config().reorganize_on_insert_failure;
    if insert_rec_on_page(tree, mtr, cursor.page_no, cursor.pos, &rec, reorganize)? {
        Ok(Some((cursor.page_no, cursor.pos + 1)))
    } else {
        Ok(None)
    }
}

/// Insert by splitting the page under `cursor` (raising the root if the
/// page is the root). Tree latch exclusive, pages reserved.
pub(crate) fn pessimistic_insert(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    cursor: &BtrCursor,
    tuple: &Tuple,
    allow_early_release: bool,
) -> Result<(PageNo, usize)> {
    if cursor.page_no == tree.root_page_no() {
        root_raise_and_insert(tree, mtr, res, cursor, tuple, allow_early_release)
    } else {
        split_and_insert(tree, mtr, res, cursor, tuple, allow_early_release)
    }
}

fn check_duplicate(tree: &BTree, cursor: &BtrCursor) -> Result<()> {
    if cursor.is_exact(tree.index().n_uniq) {
        return Err(StorageError::DuplicateKey);
    }
    Ok(())
}

/// Insert a user record into the tree
pub(crate) fn insert_entry(tree: &BTree, tuple: &Tuple) -> Result<()> {
    let tuple = prepare_tuple(tree, tuple)?;

    {
        let mut mtr = tree.start_mtr();
        let cursor = search_to_nth_level(
            tree,
            &mut mtr,
            0,
            &tuple,
            SearchMode::LessOrEqual,
            LatchMode::ModifyLeaf,
            Intention::Insert,
        )?;
        check_duplicate(tree, &cursor)?;
        if optimistic_insert(tree, &mut mtr, &cursor, &tuple)?.is_some() {
            mtr.commit()?;
            tree.counters.optimistic_inserts.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        mtr.commit()?;
    }

    let mut mtr = tree.start_mtr();
    let cursor = search_to_nth_level(
        tree,
        &mut mtr,
        0,
        &tuple,
        SearchMode::LessOrEqual,
        LatchMode::ModifyTree,
        Intention::Insert,
    )?;
    check_duplicate(tree, &cursor)?;
    let mut res = tree
        .space()
        .cache()
        .reserve(structural_reservation(cursor.tree_height))?;

    // Another thread may have made room since the optimistic pass
    if optimistic_insert(tree, &mut mtr, &cursor, &tuple)?.is_some() {
        mtr.commit()?;
        tree.counters.optimistic_inserts.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    let (page_no, pos) = pessimistic_insert(tree, &mut mtr, &mut res, &cursor, &tuple, true)?;
    mtr.commit()?;
    tree.counters.pessimistic_inserts.fetch_add(1, Ordering::Relaxed);
    debug!(
        "index {}: pessimistic insert landed on page {} position {}",
        tree.index().index_id,
        page_no,
        pos
    );
    Ok(())
}
