use std::collections::BTreeSet;

use avl_tree::AvlTree;
use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;

fn bench_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("avl_tree");

    let mut rng = ChaCha20Rng::from_seed([0x3C; 32]);
    let len = 1_u32 << 16;
    let mut keys: Vec<u32> = (0..len).collect();
    keys.shuffle(&mut rng);

    group
        .bench_function(BenchmarkId::new("avl", "insert"), |b| {
            b.iter(|| {
                let tree: AvlTree<_> = keys.iter().copied().collect();
                black_box(tree)
            })
        })
        .bench_function(BenchmarkId::new("btree-set", "insert"), |b| {
            b.iter(|| {
                let set: BTreeSet<_> = keys.iter().copied().collect();
                black_box(set)
            })
        });

    let tree: AvlTree<_> = keys.iter().copied().collect();
    let set: BTreeSet<_> = keys.iter().copied().collect();
    group
        .bench_function(BenchmarkId::new("avl", "has"), |b| {
            b.iter(|| {
                for key in &keys {
                    black_box(tree.has(key));
                }
            })
        })
        .bench_function(BenchmarkId::new("btree-set", "has"), |b| {
            b.iter(|| {
                for key in &keys {
                    black_box(set.contains(key));
                }
            })
        });

    group.finish();
}

criterion_group!(benches, bench_tree);
criterion_main!(benches);
