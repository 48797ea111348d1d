#![allow(dead_code)]

use motedb_btree::{BTree, BTreeConfig, IndexDesc, PageNo, Space, Tuple, FIL_NULL};

pub fn new_tree(index_id: u64) -> BTree {
    let config = BTreeConfig::for_testing();
    let space = Space::new(1, &config).unwrap();
    BTree::create(space, IndexDesc::new(index_id, 1, 2), config).unwrap()
}

pub fn rec(key: u64) -> Tuple {
    Tuple::with_payload(key, &[0xab; 40])
}

pub fn key(k: u64) -> Tuple {
    Tuple::from_u64(k)
}

/// Leaf pages left to right
pub fn leaf_pages(tree: &BTree) -> Vec<PageNo> {
    let cache = tree.space().cache();
    let mut page_no = tree.root_page_no();
    loop {
        let frame = cache.get(page_no).unwrap();
        let page = frame.latch().read();
        if page.is_leaf() || page.is_empty() {
            break;
        }
        page_no = page.rec(1).child_page_no();
    }
    let mut leaves = Vec::new();
    while page_no != FIL_NULL {
        leaves.push(page_no);
        let frame = cache.get(page_no).unwrap();
        page_no = frame.latch().read().next();
    }
    leaves
}

pub fn keys_on(tree: &BTree, page_no: PageNo) -> Vec<u64> {
    let frame = tree.space().cache().get(page_no).unwrap();
    let page = frame.latch().read();
    (1..=page.n_recs())
        .filter_map(|pos| page.rec(pos).to_tuple().key_u64())
        .collect()
}

pub fn scan_keys(tree: &BTree) -> Vec<u64> {
    tree.scan().unwrap().iter().filter_map(Tuple::key_u64).collect()
}
