//! Record update
//!
//! The key of a record never changes here, only its non-key fields. A
//! record that keeps its size is overwritten in place. One that changes
//! size is deleted and reinserted at the same position, on the leaf when
//! the page stays filled enough, otherwise under the tree latch where the
//! reinsert may split the page.

use log::debug;

use super::compress::compress_if_useful;
use super::cursor::{fatal, search_to_nth_level, BtrCursor, Intention, LatchMode};
use super::insert::{insert_rec_on_page, pessimistic_insert, prepare_tuple, structural_reservation};
use super::page_cur::SearchMode;
use super::BTree;
use crate::record::Tuple;
use crate::storage::{PageOp, Reservation};
use crate::txn::Mtr;
use crate::{Result, StorageError};

/// Can the record under `cursor` be replaced by `new_len` bytes without a
/// structural change?
fn fits_optimistically(tree: &BTree, mtr: &Mtr<'_>, cursor: &BtrCursor, new_len: usize) -> Result<bool> {
    let page = mtr.page(cursor.page_no)?;
    let old_len = page.rec(cursor.pos).size();
    if new_len > old_len + page.max_insert_size_after_reorganize(0) {
        return Ok(false);
    }
    let is_root = cursor.page_no == tree.root_page_no();
    let data_after = page.data_size() - old_len + new_len;
    Ok(is_root || data_after >= tree.config().merge_threshold_bytes())
}

fn optimistic_update(tree: &BTree, mtr: &mut Mtr<'_>, cursor: &BtrCursor, rec: &[u8]) -> Result<()> {
    mtr.apply(
        cursor.page_no,
        PageOp::DeleteRec {
            pos: cursor.pos as u16,
        },
    )?;
    if !insert_rec_on_page(tree, mtr, cursor.page_no, cursor.pos - 1, rec, true)? {
        fatal(mtr, &[cursor.page_no], "reinsert failed after a size check passed");
    }
    Ok(())
}

/// Delete and reinsert under the exclusive tree latch, splitting when the
/// record no longer fits
fn pessimistic_update(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    cursor: &BtrCursor,
    new: &Tuple,
    rec: &[u8],
) -> Result<()> {
    let key = tree.rec_key(&mtr.page(cursor.page_no)?.rec(cursor.pos))?;
    tree.space().ahi().forget(tree.index().index_id, &key);
    mtr.apply(
        cursor.page_no,
        PageOp::DeleteRec {
            pos: cursor.pos as u16,
        },
    )?;
    if insert_rec_on_page(tree, mtr, cursor.page_no, cursor.pos - 1, rec, true)? {
        if cursor.page_no != tree.root_page_no() {
            compress_if_useful(tree, mtr, res, cursor.page_no)?;
        }
        return Ok(());
    }
    let at = BtrCursor {
        pos: cursor.pos - 1,
        ..cursor.clone()
    };
    let (page_no, pos) = pessimistic_insert(tree, mtr, res, &at, new, false)?;
    debug!(
        "index {}: update of page {} moved the record to page {} position {}",
        tree.index().index_id,
        cursor.page_no,
        page_no,
        pos
    );
    Ok(())
}

/// Replace the non-key fields of the record carrying `new`'s key. Returns the
/// previous version of the record.
pub(crate) fn update_entry(tree: &BTree, new: &Tuple) -> Result<Tuple> {
    let new = prepare_tuple(tree, new)?;
    let n_uniq = tree.index().n_uniq;
    let rec = new.encode(tree.index().row_format)?;

    {
        let mut mtr = tree.start_mtr();
        let cursor = search_to_nth_level(
            tree,
            &mut mtr,
            0,
            &new,
            SearchMode::LessOrEqual,
            LatchMode::ModifyLeaf,
            Intention::Both,
        )?;
        if !cursor.is_exact(n_uniq) {
            return Err(StorageError::NotFound);
        }
        let (old, old_len) = {
            let r = mtr.page(cursor.page_no)?.rec(cursor.pos);
            (r.to_tuple(), r.size())
        };
        let done = if old_len == rec.len() {
            mtr.apply(
                cursor.page_no,
                PageOp::UpdateInPlace {
                    pos: cursor.pos as u16,
                    rec: rec.clone(),
                },
            )?;
            true
        } else if fits_optimistically(tree, &mtr, &cursor, rec.len())? {
            optimistic_update(tree, &mut mtr, &cursor, &rec)?;
            true
        } else {
            false
        };
        mtr.commit()?;
        if done {
            free_old_fields(tree, &old);
            return Ok(old);
        }
    }

    let mut mtr = tree.start_mtr();
    let cursor = search_to_nth_level(
        tree,
        &mut mtr,
        0,
        &new,
        SearchMode::LessOrEqual,
        LatchMode::ModifyTree,
        Intention::Both,
    )?;
    if !cursor.is_exact(n_uniq) {
        return Err(StorageError::NotFound);
    }
    // The record may have changed between the two passes
    let old = mtr.page(cursor.page_no)?.rec(cursor.pos).to_tuple();
    let mut res = tree
        .space()
        .cache()
        .reserve(structural_reservation(cursor.tree_height))?;
    pessimistic_update(tree, &mut mtr, &mut res, &cursor, &new, &rec)?;
    mtr.commit()?;
    free_old_fields(tree, &old);
    Ok(old)
}

fn free_old_fields(tree: &BTree, old: &Tuple) {
    if old.has_external() {
        tree.space().external().free_external_fields(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BTreeConfig;
    use crate::index::space::Space;
    use crate::record::IndexDesc;

    fn tree() -> BTree {
        let config = BTreeConfig::for_testing();
        let space = Space::new(1, &config).unwrap();
        BTree::create(space, IndexDesc::new(7, 1, 2), config).unwrap()
    }

    #[test]
    fn test_same_size_update_in_place() {
        let tree = tree();
        tree.insert(&Tuple::with_payload(1, b"aaaa")).unwrap();
        let old = tree.update(&Tuple::with_payload(1, b"bbbb")).unwrap();
        assert_eq!(old.fields[1], b"aaaa".to_vec());
        let now = tree.get(&Tuple::from_u64(1)).unwrap().unwrap();
        assert_eq!(now.fields[1], b"bbbb".to_vec());
    }

    #[test]
    fn test_growing_update_splits() {
        let tree = tree();
        for k in 0..12u64 {
            tree.insert(&Tuple::with_payload(k, &[1u8; 40])).unwrap();
        }
        for k in 0..12u64 {
            tree.update(&Tuple::with_payload(k, &[2u8; 120])).unwrap();
        }
        assert!(tree.height().unwrap() >= 1);
        assert!(tree.validate());
        for k in 0..12u64 {
            let rec = tree.get(&Tuple::from_u64(k)).unwrap().unwrap();
            assert_eq!(rec.fields[1], vec![2u8; 120]);
        }
    }

    #[test]
    fn test_update_missing_key() {
        let tree = tree();
        let err = tree.update(&Tuple::with_payload(9, b"x")).unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }
}
