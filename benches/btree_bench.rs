use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use motedb_btree::{BTree, BTreeConfig, IndexDesc, Space, Tuple};

fn new_tree() -> BTree {
    let config = BTreeConfig::default();
    let space = Space::new(1, &config).unwrap();
    BTree::create(space, IndexDesc::new(1, 1, 2), config).unwrap()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insert");
    for &n in &[1_000u64, 10_000] {
        group.bench_with_input(BenchmarkId::new("sequential", n), &n, |b, &n| {
            b.iter_batched(
                new_tree,
                |tree| {
                    for k in 0..n {
                        tree.insert(&Tuple::with_payload(k, &[7u8; 64])).unwrap();
                    }
                    tree
                },
                BatchSize::LargeInput,
            );
        });

        let mut keys: Vec<u64> = (0..n).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(n));
        group.bench_with_input(BenchmarkId::new("random", n), &keys, |b, keys| {
            b.iter_batched(
                new_tree,
                |tree| {
                    for &k in keys {
                        tree.insert(&Tuple::with_payload(k, &[7u8; 64])).unwrap();
                    }
                    tree
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let tree = new_tree();
    for k in 0..10_000u64 {
        tree.insert(&Tuple::with_payload(k, &[7u8; 64])).unwrap();
    }
    c.bench_function("btree_get_10k", |b| {
        let mut k = 0u64;
        b.iter(|| {
            k = (k + 7919) % 10_000;
            black_box(tree.get(&Tuple::from_u64(k)).unwrap());
        });
    });
}

criterion_group!(benches, bench_insert, bench_get);
criterion_main!(benches);
