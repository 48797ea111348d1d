mod common;

use common::{key, keys_on, leaf_pages, new_tree, rec};
use motedb_btree::{LockMode, RowFormat, StorageError};

fn lock_key(k: u64) -> Vec<u8> {
    key(k).encode(RowFormat::Compact).unwrap()
}

#[test]
fn test_locks_follow_records_through_splits() {
    let tree = new_tree(1);
    for k in 0..10u64 {
        tree.insert(&rec(k * 100)).unwrap();
    }
    let root = tree.root_page_no();
    tree.lock_record(7, &key(900), LockMode::Exclusive).unwrap();
    tree.lock_record(8, &key(0), LockMode::Shared).unwrap();

    // Grow the tree until the root content has been moved down and split
    for k in 1..400u64 {
        if k % 100 != 0 {
            tree.insert(&rec(k)).unwrap();
        }
    }
    assert!(tree.height().unwrap() >= 1);

    let locks = tree.space().locks();
    let page_900 = tree.locate(&key(900)).unwrap().unwrap();
    let page_0 = tree.locate(&key(0)).unwrap().unwrap();
    assert_ne!(page_900, root);
    assert_ne!(page_0, page_900);
    assert_eq!(locks.holds(7, page_900, &lock_key(900)), Some(LockMode::Exclusive));
    assert_eq!(locks.holds(8, page_0, &lock_key(0)), Some(LockMode::Shared));
    assert_eq!(locks.locks_on_page(root), 0);

    // The lock still conflicts at its new home
    let err = tree.lock_record(9, &key(900), LockMode::Shared).unwrap_err();
    assert!(matches!(err, StorageError::Lock(_)));
}

#[test]
fn test_locks_follow_records_through_merges() {
    let tree = new_tree(2);
    for k in 0..200u64 {
        tree.insert(&rec(k)).unwrap();
    }
    let leaves = leaf_pages(&tree);
    let left = leaves[leaves.len() / 2];
    let right = leaves[leaves.len() / 2 + 1];

    // Leave a single record on the left page so it can absorb its neighbor
    for &k in &keys_on(&tree, left)[1..] {
        tree.delete(&key(k)).unwrap();
    }
    let on_right = keys_on(&tree, right);
    let (&locked, doomed) = on_right.split_last().unwrap();
    tree.lock_record(3, &key(locked), LockMode::Exclusive).unwrap();

    for &k in doomed {
        tree.delete(&key(k)).unwrap();
    }
    let home = tree.locate(&key(locked)).unwrap().unwrap();
    assert_eq!(home, left);
    assert!(!leaf_pages(&tree).contains(&right));
    let locks = tree.space().locks();
    assert_eq!(locks.holds(3, home, &lock_key(locked)), Some(LockMode::Exclusive));
    assert_eq!(locks.locks_on_page(right), 0);

    tree.release_locks(3);
    assert_eq!(locks.holds(3, home, &lock_key(locked)), None);
    tree.lock_record(4, &key(locked), LockMode::Exclusive).unwrap();
}

#[test]
fn test_locks_collapse_into_root() {
    let tree = new_tree(3);
    for k in 0..60u64 {
        tree.insert(&rec(k)).unwrap();
    }
    assert!(tree.height().unwrap() >= 1);
    tree.lock_record(5, &key(0), LockMode::Shared).unwrap();
    for k in 1..60u64 {
        tree.delete(&key(k)).unwrap();
    }
    assert_eq!(tree.height().unwrap(), 0);
    let locks = tree.space().locks();
    assert_eq!(locks.holds(5, tree.root_page_no(), &lock_key(0)), Some(LockMode::Shared));
}
