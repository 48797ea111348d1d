//! Page compression
//!
//! An under-filled page is merged into a sibling that shares its father,
//! left sibling first. A page alone on its level is lifted into its father,
//! which shortens the tree by one level. A page losing its last record is
//! discarded; if it was the only page on its level the whole single-page
//! chain above it goes too and the root becomes an empty leaf.
//!
//! All of this runs under the exclusive tree latch. Leaf siblings were
//! X-latched by the tree-modify descent; non-leaf pages are latched on
//! demand, which cannot deadlock because only the tree latch holder
//! latches them.

use std::sync::atomic::Ordering;

use log::debug;

use super::cursor::{fatal, page_father, BtrCursor};
use super::delete::{node_ptr_delete, pessimistic_delete};
use super::insert::reorganize_page;
use super::split::set_node_ptr_child;
use super::BTree;
use crate::config::BTreeConfig;
use crate::storage::{Page, PageNo, PageOp, Reservation, FIL_NULL};
use crate::txn::Mtr;
use crate::Result;

/// Should `page` be compressed? Never for the root.
pub fn compress_recommendation(config: &BTreeConfig, page: &Page, is_root: bool) -> bool {
    if is_root {
        return false;
    }
    page.data_size() < config.merge_threshold_bytes()
        || (page.prev() == FIL_NULL && page.next() == FIL_NULL)
}

/// Compress `page_no` if recommended. Returns whether the page was merged
/// or lifted away.
pub(crate) fn compress_if_useful(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    page_no: PageNo,
) -> Result<bool> {
    let is_root = page_no == tree.root_page_no();
    let recommended = compress_recommendation(tree.config(), mtr.page(page_no)?, is_root);
    if !recommended {
        return Ok(false);
    }
    compress(tree, mtr, res, page_no)
}

fn page_records(page: &Page) -> Vec<Vec<u8>> {
    (1..=page.n_recs())
        .map(|p| page.rec(p).as_bytes().to_vec())
        .collect()
}

/// Room for all of `page`'s records on `target` after a reorganize?
fn can_merge(target: &Page, page: &Page) -> bool {
    target.max_insert_size_after_reorganize(page.n_recs()) >= page.data_size()
}

/// Take `page_no` out of its level's sibling list
fn unlink(mtr: &mut Mtr<'_>, prev: PageNo, next: PageNo) -> Result<()> {
    if prev != FIL_NULL {
        mtr.x_latch(prev)?;
        mtr.apply(prev, PageOp::SetNext(next))?;
    }
    if next != FIL_NULL {
        mtr.x_latch(next)?;
        mtr.apply(next, PageOp::SetPrev(prev))?;
    }
    Ok(())
}

fn free_page(tree: &BTree, mtr: &mut Mtr<'_>, page_no: PageNo) -> Result<()> {
    tree.space().ahi().drop_page_hash_index(page_no);
    mtr.free_page(tree.index().index_id, page_no)
}

/// Make room for `n` records of `data` bytes on `target`, reorganizing if
/// the free space is fragmented
fn prepare_merge_target(tree: &BTree, mtr: &mut Mtr<'_>, target: PageNo, n: usize, data: usize) -> Result<()> {
    if mtr.page(target)?.max_insert_size(n) < data {
        reorganize_page(tree, mtr, target)?;
    }
    Ok(())
}

/// Merge `page_no` into a sibling, or lift it if it is alone on its level.
/// Returns false when no sibling can take the records; the page then simply
/// stays under-filled.
pub(crate) fn compress(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    page_no: PageNo,
) -> Result<bool> {
    let index_id = tree.index().index_id;
    let (level, prev, next) = {
        let page = mtr.page(page_no)?;
        (page.level(), page.prev(), page.next())
    };

    if prev == FIL_NULL && next == FIL_NULL {
        lift_page_up(tree, mtr, page_no)?;
        return Ok(true);
    }

    let father = page_father(tree, mtr, page_no)?;
    let (left_shares_father, right_shares_father) = {
        let f = mtr.page(father.page_no)?;
        let p = father.pos;
        (
            prev != FIL_NULL && p > 1 && f.rec(p - 1).child_page_no() == prev,
            next != FIL_NULL && p < f.n_recs() && f.rec(p + 1).child_page_no() == next,
        )
    };

    let merge_left = left_shares_father && {
        mtr.x_latch(prev)?;
        can_merge(mtr.page(prev)?, mtr.page(page_no)?)
    };
    let merge_right = !merge_left && right_shares_father && {
        mtr.x_latch(next)?;
        can_merge(mtr.page(next)?, mtr.page(page_no)?)
    };
    if !merge_left && !merge_right {
        return Ok(false);
    }

    let (recs, data) = {
        let page = mtr.page(page_no)?;
        (page_records(page), page.data_size())
    };
    let n = recs.len();
    tree.space().ahi().drop_page_hash_index(page_no);

    let merged = if merge_left {
        prepare_merge_target(tree, mtr, prev, n, data)?;
        let after = mtr.page(prev)?.n_recs() as u16;
        mtr.apply(prev, PageOp::InsertList { after, recs })?;
        if level == 0 {
            tree.space().locks().update_merge_left(prev, page_no);
        }
        unlink(mtr, prev, next)?;
        pessimistic_delete(tree, mtr, res, &father)?;
        prev
    } else {
        prepare_merge_target(tree, mtr, next, n, data)?;
        // The page's first record may carry the minimum-record mark; it
        // stays valid since `next` becomes the leftmost page if `page_no`
        // was
        mtr.apply(next, PageOp::InsertList { after: 0, recs })?;
        if level == 0 {
            tree.space().locks().update_merge_right(next, page_no);
        }
        set_node_ptr_child(mtr, &father, next)?;
        unlink(mtr, prev, next)?;
        let right_ptr = BtrCursor {
            pos: father.pos + 1,
            ..father.clone()
        };
        pessimistic_delete(tree, mtr, res, &right_ptr)?;
        next
    };

    free_page(tree, mtr, page_no)?;
    tree.counters.merges.fetch_add(1, Ordering::Relaxed);
    debug!(
        "index {}: merged page {} into {} at level {}",
        index_id, page_no, merged, level
    );

    // The merge may have left the survivor alone on its level
    let alone = {
        let page = mtr.page(merged)?;
        page.prev() == FIL_NULL && page.next() == FIL_NULL
    };
    if alone && merged != tree.root_page_no() {
        lift_page_up(tree, mtr, merged)?;
    }
    Ok(true)
}

/// Remove a page whose last record is being deleted
pub(crate) fn discard_page(
    tree: &BTree,
    mtr: &mut Mtr<'_>,
    res: &mut Reservation<'_>,
    page_no: PageNo,
) -> Result<()> {
    let (level, prev, next) = {
        let page = mtr.page(page_no)?;
        (page.level(), page.prev(), page.next())
    };
    let heir = if prev != FIL_NULL {
        prev
    } else if next != FIL_NULL {
        next
    } else {
        return discard_only_page_on_level(tree, mtr, page_no);
    };
    mtr.x_latch(heir)?;

    if level > 0 && prev == FIL_NULL {
        // The right sibling becomes the leftmost page of the level
        mtr.apply(next, PageOp::SetMinRecMark { pos: 1, on: true })?;
    }
    node_ptr_delete(tree, mtr, res, page_no)?;
    unlink(mtr, prev, next)?;
    if level == 0 {
        tree.space().locks().update_discard(heir, page_no);
    }
    free_page(tree, mtr, page_no)?;
    tree.counters.discards.fetch_add(1, Ordering::Relaxed);
    debug!(
        "index {}: discarded page {} at level {}, heir {}",
        tree.index().index_id,
        page_no,
        level,
        heir
    );

    let alone = {
        let page = mtr.page(heir)?;
        page.prev() == FIL_NULL && page.next() == FIL_NULL
    };
    if alone && heir != tree.root_page_no() {
        lift_page_up(tree, mtr, heir)?;
    }
    Ok(())
}

/// Discard a page that is the only one on its level together with every
/// single-record ancestor; the root ends up an empty leaf.
pub(crate) fn discard_only_page_on_level(tree: &BTree, mtr: &mut Mtr<'_>, page_no: PageNo) -> Result<()> {
    let index_id = tree.index().index_id;
    let root = tree.root_page_no();
    let mut page_no = page_no;
    while page_no != root {
        let (n_recs, prev, next, level) = {
            let page = mtr.page(page_no)?;
            (page.n_recs(), page.prev(), page.next(), page.level())
        };
        if n_recs != 1 || prev != FIL_NULL || next != FIL_NULL {
            fatal(mtr, &[page_no], "discarding an only page that is not a single-record page");
        }
        let father = page_father(tree, mtr, page_no)?;
        // Every ancestor up to the root is freed too
        if level == 0 {
            tree.space().locks().update_discard(root, page_no);
        }
        free_page(tree, mtr, page_no)?;
        tree.counters.discards.fetch_add(1, Ordering::Relaxed);
        page_no = father.page_no;
    }

    tree.space().ahi().drop_page_hash_index(root);
    mtr.apply(root, PageOp::Empty { level: 0 })?;
    tree.space().cache().set_segment(index_id, root, 0);
    debug!("index {}: tree emptied, root {} is a leaf again", index_id, root);
    Ok(())
}

/// Move the records of a page that is alone on its level into its father,
/// removing one tree level. A leaf is only ever lifted into the root; below
/// a taller chain the father is lifted instead. Returns the page now
/// holding the records.
pub(crate) fn lift_page_up(tree: &BTree, mtr: &mut Mtr<'_>, page_no: PageNo) -> Result<PageNo> {
    let index_id = tree.index().index_id;
    let root = tree.root_page_no();
    let page_level = mtr.page(page_no)?.level();

    let father = page_father(tree, mtr, page_no)?;
    let father_recs = mtr.page(father.page_no)?.n_recs();
    if father_recs != 1 {
        fatal(
            mtr,
            &[father.page_no, page_no],
            "lifting a page whose father holds more than one node pointer",
        );
    }

    // Ancestors above the father; their searches must happen while the
    // tree is still consistent
    let mut chain = Vec::new();
    let mut ancestor = father.page_no;
    while ancestor != root {
        ancestor = page_father(tree, mtr, ancestor)?.page_no;
        chain.push(ancestor);
    }

    let (lifted, target, rest) = if page_level == 0 && !chain.is_empty() {
        (father.page_no, chain[0], &chain[1..])
    } else {
        (page_no, father.page_no, &chain[..])
    };

    let (level, recs) = {
        let page = mtr.page(lifted)?;
        (page.level(), page_records(page))
    };
    tree.space().ahi().drop_page_hash_index(target);
    mtr.apply(target, PageOp::Empty { level })?;
    mtr.apply(target, PageOp::InsertList { after: 0, recs })?;
    tree.space().cache().set_segment(index_id, target, level);
    for (i, &anc) in rest.iter().enumerate() {
        mtr.apply(anc, PageOp::SetLevel(level + 1 + i as u16))?;
    }
    if level == 0 {
        tree.space().locks().update_copy_and_discard(target, lifted);
    }
    free_page(tree, mtr, lifted)?;
    tree.counters.lifts.fetch_add(1, Ordering::Relaxed);
    debug!(
        "index {}: lifted page {} into {}, now level {}",
        index_id, lifted, target, level
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RowFormat, Tuple};

    fn page_with(n: u64, prev: PageNo, next: PageNo) -> Page {
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
    fn test_recommendation() {
        let config = BTreeConfig::for_testing();
        assert!(compress_recommendation(&config, &page_with(3, 1, 2), false));
        assert!(!compress_recommendation(&config, &page_with(3, 1, 2), true));
        assert!(!compress_recommendation(&config, &page_with(10, 1, 2), false));
        // Alone on its level: lift regardless of fill
        assert!(compress_recommendation(&config, &page_with(10, FIL_NULL, FIL_NULL), false));
    }

    #[test]
    fn test_discard_only_pages_moves_locks_to_root() {
        use crate::index::space::Space;
        use crate::record::{build_node_pointer, IndexDesc, REC_INFO_MIN_REC};
        use crate::storage::AllocDirection;
        use crate::txn::LockMode;

        let config = BTreeConfig::for_testing();
        let space = Space::new(1, &config).unwrap();
        let tree = BTree::create(space, IndexDesc::new(21, 1, 2), config).unwrap();
        let root = tree.root_page_no();
        let encode = |t: &Tuple| t.encode(RowFormat::Compact).unwrap();
        let min_ptr = |child: PageNo| {
            let mut ptr = build_node_pointer(tree.index(), &Tuple::from_u64(5), child);
            ptr.info_bits |= REC_INFO_MIN_REC;
            ptr
        };

        // root (level 2) -> mid (level 1) -> leaf, one record each
        let (mid, leaf) = {
            let mut res = tree.space().cache().reserve(2).unwrap();
            let mut mtr = tree.start_mtr();
            mtr.x_lock_tree(tree.latch());
            mtr.x_latch(root).unwrap();
            let leaf = mtr
                .create_page(&mut res, 21, None, AllocDirection::NoDirection, 0, true)
                .unwrap();
            let mid = mtr
                .create_page(&mut res, 21, None, AllocDirection::NoDirection, 1, true)
                .unwrap();
            let rec = encode(&Tuple::with_payload(5, b"v"));
            mtr.apply(leaf, PageOp::InsertRec { after: 0, rec }).unwrap();
            let rec = encode(&min_ptr(leaf));
            mtr.apply(mid, PageOp::InsertRec { after: 0, rec }).unwrap();
            mtr.apply(root, PageOp::Empty { level: 2 }).unwrap();
            let rec = encode(&min_ptr(mid));
            mtr.apply(root, PageOp::InsertRec { after: 0, rec }).unwrap();
            mtr.commit().unwrap();
            tree.space().cache().set_segment(21, root, 2);
            (mid, leaf)
        };
        assert!(tree.validate());
        assert_eq!(tree.height().unwrap(), 2);

        tree.lock_record(9, &Tuple::from_u64(5), LockMode::Exclusive).unwrap();
        let lock_key = encode(&Tuple::from_u64(5));
        assert_eq!(tree.space().locks().holds(9, leaf, &lock_key), Some(LockMode::Exclusive));

        let mut mtr = tree.start_mtr();
        mtr.x_lock_tree(tree.latch());
        mtr.x_latch(leaf).unwrap();
        discard_only_page_on_level(&tree, &mut mtr, leaf).unwrap();
        mtr.commit().unwrap();

        assert_eq!(tree.height().unwrap(), 0);
        assert!(tree.scan().unwrap().is_empty());
        assert_eq!(tree.space().locks().holds(9, root, &lock_key), Some(LockMode::Exclusive));
        assert_eq!(tree.space().locks().locks_on_page(mid), 0);
        assert_eq!(tree.space().locks().locks_on_page(leaf), 0);
        assert!(tree.validate());
    }

    #[test]
    fn test_can_merge_respects_capacity() {
        let small = page_with(3, 1, 2);
        let full = page_with(12, 1, 2);
        assert!(can_merge(&small, &small));
        assert!(!can_merge(&full, &small));
    }
}
