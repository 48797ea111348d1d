mod common;

use std::fs::OpenOptions;
use std::io::Write;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::TempDir;

use common::{key, rec, scan_keys};
use motedb_btree::config::RedoConfig;
use motedb_btree::txn::RedoLog;
use motedb_btree::{BTree, BTreeConfig, IndexDesc, Space};

fn durable_config(dir: &TempDir) -> BTreeConfig {
    BTreeConfig {
        redo: RedoConfig {
            sync_on_commit: false,
            path: Some(dir.path().join("redo.log")),
        },
        ..BTreeConfig::for_testing()
    }
}

/// Build a tree through splits and merges; returns its root and live keys
fn build(config: &BTreeConfig) -> (u32, Vec<u64>) {
    let space = Space::new(1, config).unwrap();
    let tree = BTree::create(space, IndexDesc::new(1, 1, 2), config.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let mut ks: Vec<u64> = (0..600).collect();
    ks.shuffle(&mut rng);
    for &k in &ks {
        tree.insert(&rec(k)).unwrap();
    }
    let (gone, kept) = ks.split_at(350);
    for &k in gone {
        tree.delete(&key(k)).unwrap();
    }
    let mut kept = kept.to_vec();
    kept.sort_unstable();
    assert!(tree.validate());
    (tree.root_page_no(), kept)
}

#[test]
fn test_replayed_log_rebuilds_valid_tree() {
    let dir = TempDir::new().unwrap();
    let config = durable_config(&dir);
    let (root, kept) = build(&config);

    let records = RedoLog::read_file(&dir.path().join("redo.log")).unwrap();
    assert!(!records.is_empty());
    let (space, stats) = Space::recover(1, &BTreeConfig::for_testing(), &records).unwrap();
    assert_eq!(stats.applied, records.len());
    assert_eq!(stats.skipped, 0);

    let tree = BTree::open(space, IndexDesc::new(1, 1, 2), root, BTreeConfig::for_testing()).unwrap();
    assert!(tree.validate());
    assert_eq!(scan_keys(&tree), kept);

    // The recovered tree keeps working
    for k in 1000..1100u64 {
        tree.insert(&rec(k)).unwrap();
    }
    assert!(tree.validate());
    assert_eq!(scan_keys(&tree).len(), kept.len() + 100);
}

#[test]
fn test_torn_tail_is_ignored() {
    let dir = TempDir::new().unwrap();
    let config = durable_config(&dir);
    let (root, kept) = build(&config);

    let path = dir.path().join("redo.log");
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x5a; 37]).unwrap();
    drop(file);

    let records = RedoLog::read_file(&path).unwrap();
    let (space, _) = Space::recover(1, &BTreeConfig::for_testing(), &records).unwrap();
    let tree = BTree::open(space, IndexDesc::new(1, 1, 2), root, BTreeConfig::for_testing()).unwrap();
    assert!(tree.validate());
    assert_eq!(scan_keys(&tree), kept);
}
