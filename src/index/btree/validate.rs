//! Whole-tree consistency check
//!
//! Walks the tree level by level from the root under the shared tree
//! latch. Every level's sibling list must visit exactly the children the
//! level above points to, in order, and every page's key range must sit
//! between its own node pointer and the next one.

use std::cmp::Ordering;

use log::warn;

use super::BTree;
use crate::record::{compare_tuple_rec, Tuple};
use crate::storage::{Page, PageNo, FIL_NULL};
use crate::Result;

/// Node pointer seen from the level above: `None` key is the minimum record
type ParentPtr = (Option<Tuple>, PageNo);

fn report(page: &Page, what: &str) -> bool {
    warn!("btree validate: page {}: {}\n{:?}", page.page_no(), what, page);
    false
}

/// Check the whole index; problems are logged and make the result false
pub(crate) fn validate_index(tree: &BTree) -> bool {
    match walk(tree) {
        Ok(ok) => ok,
        Err(e) => {
            warn!("btree validate: index {}: {}", tree.index().index_id, e);
            false
        }
    }
}

fn walk(tree: &BTree) -> Result<bool> {
    let mut mtr = tree.start_mtr();
    mtr.s_lock_tree(tree.latch());
    let cache = mtr.cache();
    let root = tree.root_page_no();

    let root_level = {
        let frame = cache.get(root)?;
        let page = frame.latch().read();
        page.level()
    };

    let mut parents: Vec<ParentPtr> = vec![(None, root)];
    for level in (0..=root_level).rev() {
        let mut children = Vec::new();
        let mut prev_no = FIL_NULL;
        let mut prev_last: Option<Tuple> = None;
        let mut page_no = parents[0].1;
        let mut count = 0;

        while page_no != FIL_NULL {
            let frame = cache.get(page_no)?;
            let page = frame.latch().read();
            let Some((ptr_key, expected)) = parents.get(count) else {
                return Ok(report(&page, "more pages on the level than node pointers above"));
            };
            if !check_page(tree, &page, level, *expected, prev_no, ptr_key) {
                return Ok(false);
            }
            if !check_bounds(tree, &page, prev_last.as_ref(), parents.get(count + 1)) {
                return Ok(false);
            }

            if level > 0 {
                for pos in 1..=page.n_recs() {
                    let rec = page.rec(pos);
                    let key = (!rec.is_min_rec()).then(|| rec.copy_prefix(tree.index().n_uniq));
                    children.push((key, rec.child_page_no()));
                }
            }
            prev_last = page
                .last_rec()
                .map(|rec| rec.copy_prefix(tree.index().n_uniq));
            prev_no = page_no;
            page_no = page.next();
            count += 1;
        }

        if count != parents.len() {
            warn!(
                "btree validate: index {}: level {} has {} pages, {} node pointers above",
                tree.index().index_id,
                level,
                count,
                parents.len()
            );
            return Ok(false);
        }
        parents = children;
    }
    mtr.commit()?;
    Ok(true)
}

fn check_page(
    tree: &BTree,
    page: &Page,
    level: u16,
    expected: PageNo,
    prev_no: PageNo,
    ptr_key: &Option<Tuple>,
) -> bool {
    let index = tree.index();
    let page_no = page.page_no();
    if let Err(e) = page.validate() {
        return report(page, &e.to_string());
    }
    if page_no != expected {
        return report(page, &format!("node pointer above names page {}", expected));
    }
    if !page.in_use() || page.index_id() != index.index_id {
        return report(page, &format!("not an in-use page of index {}", index.index_id));
    }
    if page.level() != level {
        return report(page, &format!("expected level {}", level));
    }
    if page.is_compact() != index.is_compact() {
        return report(page, "row format differs from the index");
    }
    if page.prev() != prev_no {
        return report(page, &format!("prev link should be {}", prev_no));
    }
    if page_no != tree.root_page_no() && page.is_empty() {
        return report(page, "empty non-root page");
    }

    if level > 0 && !page.is_empty() {
        let leftmost = page.prev() == FIL_NULL;
        if page.rec(1).is_min_rec() != leftmost {
            return report(page, "minimum-record mark does not match leftmost position");
        }
    }

    if let (Some(key), Some(first)) = (ptr_key, page.first_rec()) {
        let (ord, _) = compare_tuple_rec(key, &first, index.n_uniq, 0);
        if ord == Ordering::Greater {
            return report(page, &format!("first record below node pointer {:?}", key.fields));
        }
        if level > 0 && ord != Ordering::Equal {
            return report(page, &format!("first record does not match node pointer {:?}", key.fields));
        }
    }
    true
}

/// The page's keys lie above the previous page's and below the next node
/// pointer
fn check_bounds(tree: &BTree, page: &Page, prev_last: Option<&Tuple>, next_ptr: Option<&ParentPtr>) -> bool {
    let n_uniq = tree.index().n_uniq;
    if let (Some(prev), Some(first)) = (prev_last, page.first_rec()) {
        if !first.is_min_rec() && compare_tuple_rec(prev, &first, n_uniq, 0).0 != Ordering::Less {
            return report(page, "first record not above the previous page's last");
        }
    }
    if let (Some((Some(next_key), _)), Some(last)) = (next_ptr, page.last_rec()) {
        // next_key > last  <=>  last < next_key
        if compare_tuple_rec(next_key, &last, n_uniq, 0).0 != Ordering::Greater {
            return report(page, &format!("last record not below next node pointer {:?}", next_key.fields));
        }
    }
    true
}
