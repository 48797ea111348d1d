//! Delete state machine
//!
//! The optimistic pass removes the record from the X-latched leaf when the
//! page stays comfortably filled. Otherwise the delete is redone under the
//! exclusive tree latch, where removing a page's first node pointer or its
//! last record can ripple up the tree, and an under-filled page is
//! compressed afterwards.

use std::sync::atomic::Ordering;

use log::debug;

use super::compress::{compress_if_useful, discard_page};
use super::cursor::{page_father, search_to_nth_level, BtrCursor, Intention, LatchMode};
use super::insert::structural_reservation;
use super::page_cur::SearchMode;
use super::split::insert_on_non_leaf_level;
use super::BTree;
use crate::config::BTreeConfig;
use crate::record::{build_node_pointer, Tuple};
use crate::storage::{Page, PageNo, PageOp, Reservation, FIL_NULL};
use crate::txn::Mtr;
use crate::{Result, StorageError};

/// Can a record of `rec_size` bytes go without the page becoming a
/// compression candidate? The root may always be under-filled.
pub fn can_delete_without_compress(config: &BTreeConfig, page: &Page, rec_size: usize, is_root: bool) -> bool {
    if is_root {
        return true;
    }
    let too_low = page.data_size().saturating_sub(rec_size) < config.merge_threshold_bytes();
    let alone = page.prev() == FIL_NULL && page.next() == FIL_NULL;
    !(too_low || alone || page.n_recs() < 2)
}

/// Remove the record under `cursor` from the latched leaf if no structural
/// change can follow. Returns whether the record was removed.
pub(crate) fn optimistic_delete(tree: &BTree, mtr: &mut Mtr<'_>, cursor: &BtrCursor) -> Result<bool> {
    let is_root = cursor.page_no == tree.root_page_no();
    let key = {
        let page = mtr.page(cursor.page_no)?;
        let rec = page.rec(cursor.pos);
        if rec.has_external() || !can_delete_without_compress(tree.config(), page, rec.size(), is_root) {
            return Ok(false);
        }
        tree.rec_key(&rec)?
    };
    tree.space().ahi().forget(tree.index().index_id, &key);
    mtr.apply(
        cursor.page_no,
        PageOp::DeleteRec {
            pos: cursor.pos as u16,
        },
    )?;
    Ok(true)
}

/// Delete the node pointer to `page_no` from its father
pub(crate) fn node_ptr_delete(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    page_no: PageNo,
) -> Result<()> {
    let father = page_father(tree, mtr, page_no)?;
    pessimistic_delete(tree, mtr, res, &father)
}

/// Delete the record under `cursor` on any level, discarding the page if it
/// was its last record and compressing it if it ends up under-filled.
/// Tree latch exclusive, pages reserved.
pub(crate) fn pessimistic_delete(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    cursor: &BtrCursor,
) -> Result<()> {
    let index = tree.index();
    let page_no = cursor.page_no;
    let pos = cursor.pos;
    let is_root = page_no == tree.root_page_no();
    let (level, n_recs, prev, removed) = {
        let page = mtr.page(page_no)?;
        (page.level(), page.n_recs(), page.prev(), page.rec(pos).to_tuple())
    };

    if level == 0 && removed.has_external() {
        tree.space().external().free_external_fields(&removed);
    }

    if n_recs < 2 && !is_root {
        return discard_page(tree, mtr, res, page_no);
    }

    if level > 0 && pos == 1 {
        if prev == FIL_NULL {
            // The next node pointer becomes the leftmost of the level
            if n_recs >= 2 {
                mtr.apply(page_no, PageOp::SetMinRecMark { pos: 2, on: true })?;
            }
        } else {
            // The father pointer must follow the page's new first key
            let next_first = mtr.page(page_no)?.rec(2).to_tuple();
            node_ptr_delete(tree, mtr, res, page_no)?;
            let node_ptr = build_node_pointer(index, &next_first, page_no);
            insert_on_non_leaf_level(tree, mtr, res, level + 1, &node_ptr)?;
        }
    }

    if level == 0 {
        let key = tree.rec_key(&mtr.page(page_no)?.rec(pos))?;
        tree.space().ahi().forget(index.index_id, &key);
    }
    mtr.apply(page_no, PageOp::DeleteRec { pos: pos as u16 })?;

    if !is_root {
        compress_if_useful(tree, mtr, res, page_no)?;
    }
    Ok(())
}

/// Delete the user record with the given key, returning it
pub(crate) fn delete_entry(tree: &BTree, key: &Tuple) -> Result<Tuple> {
    let search = tree.search_tuple(key)?;
    let n_uniq = tree.index().n_uniq;

    {
        let mut mtr = tree.start_mtr();
        let cursor = search_to_nth_level(
            tree,
            &mut mtr,
            0,
            &search,
            SearchMode::LessOrEqual,
            LatchMode::ModifyLeaf,
            Intention::Delete,
        )?;
        if !cursor.is_exact(n_uniq) {
            return Err(StorageError::NotFound);
        }
        let removed = mtr.page(cursor.page_no)?.rec(cursor.pos).to_tuple();
        if optimistic_delete(tree, &mut mtr, &cursor)? {
            mtr.commit()?;
            tree.counters.optimistic_deletes.fetch_add(1, Ordering::Relaxed);
            return Ok(removed);
        }
        mtr.commit()?;
    }

    let mut mtr = tree.start_mtr();
    let cursor = search_to_nth_level(
        tree,
        &mut mtr,
        0,
        &search,
        SearchMode::LessOrEqual,
        LatchMode::ModifyTree,
        Intention::Delete,
    )?;
    if !cursor.is_exact(n_uniq) {
        return Err(StorageError::NotFound);
    }
    let removed = mtr.page(cursor.page_no)?.rec(cursor.pos).to_tuple();
    let mut res = tree
        .space()
        .cache()
        .reserve(structural_reservation(cursor.tree_height))?;
    pessimistic_delete(tree, &mut mtr, &mut res, &cursor)?;
    mtr.commit()?;
    tree.counters.pessimistic_deletes.fetch_add(1, Ordering::Relaxed);
    debug!(
        "index {}: pessimistic delete on page {}{}",
        tree.index().index_id,
        cursor.page_no,
        if cursor.restarted { " (restarted descent)" } else { "" }
    );
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RowFormat;

    fn leaf(n: u64, prev: PageNo, next: PageNo) -> Page {
        let mut page = Page::new(4, 1024);
        page.apply(&PageOp::Create {
            index_id: 1,
            level: 0,
            compact: true,
        })
        .unwrap();
        let recs = (0..n)
            .map(|k| Tuple::with_payload(k, &[1u8; 60]).encode(RowFormat::Compact).unwrap())
            .collect();
        page.apply(&PageOp::InsertList { after: 0, recs }).unwrap();
        page.apply(&PageOp::SetPrev(prev)).unwrap();
        page.apply(&PageOp::SetNext(next)).unwrap();
        page
    }

    #[test]
    fn test_root_never_needs_compress() {
        let config = BTreeConfig::for_testing();
        let page = leaf(1, FIL_NULL, FIL_NULL);
        assert!(can_delete_without_compress(&config, &page, 72, true));
        assert!(!can_delete_without_compress(&config, &page, 72, false));
    }

    #[test]
    fn test_threshold_decides() {
        let config = BTreeConfig::for_testing();
        // 10 records of 72 bytes: 720 bytes, threshold 512
        let page = leaf(10, 7, 8);
        assert!(can_delete_without_compress(&config, &page, 72, false));
        let page = leaf(7, 7, 8);
        assert!(!can_delete_without_compress(&config, &page, 72, false));
    }

    #[test]
    fn test_only_page_on_level_is_a_candidate() {
        let config = BTreeConfig::for_testing();
        let page = leaf(10, FIL_NULL, FIL_NULL);
        assert!(!can_delete_without_compress(&config, &page, 72, false));
    }
}
