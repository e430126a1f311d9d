//! Block store allocator benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gmetrics_core::BlockStore;

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("block_store", size), &size, |b, &sz| {
            let mut store = BlockStore::new("bench-alloc-free", 16 * 1024 * 1024).unwrap();
            b.iter(|| {
                let ptr = store.allocate(sz, None).unwrap();
                criterion::black_box(ptr);
                store.deallocate(ptr);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let mut store = BlockStore::new("bench-burst", 16 * 1024 * 1024).unwrap();
            let ptrs: Vec<*mut u8> = (0..1000).filter_map(|_| store.allocate(64, None)).collect();
            criterion::black_box(&ptrs);
            for ptr in ptrs {
                store.deallocate(ptr);
            }
        });
    });

    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_growth");

    group.bench_function("grow_in_place_then_shrink", |b| {
        let mut store = BlockStore::new("bench-realloc", 16 * 1024 * 1024).unwrap();
        b.iter(|| {
            let ptr = store.allocate(64, None).unwrap();
            let grown = store.reallocate(ptr, 1024).unwrap();
            let shrunk = store.reallocate(grown, 32).unwrap();
            store.deallocate(shrunk);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst, bench_realloc_growth);
criterion_main!(benches);
