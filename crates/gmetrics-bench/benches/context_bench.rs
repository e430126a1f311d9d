//! Runtime context benchmarks: the per-thread default store path and the
//! dedicated-store path interposed `malloc`/`free` actually exercise.

use criterion::{criterion_group, criterion_main, Criterion};
use gmetrics_runtime::Context;

fn bench_malloc_free_default_store(c: &mut Criterion) {
    let context = Context::new_for_testing();
    c.bench_function("context_malloc_free_small", |b| {
        b.iter(|| {
            let ptr = context.malloc(64);
            criterion::black_box(ptr);
            context.free(ptr);
        });
    });
}

fn bench_malloc_free_dedicated_store(c: &mut Criterion) {
    let context = Context::new_for_testing();
    let size = gmetrics_config::config().dedicated_threshold + 1;
    c.bench_function("context_malloc_free_dedicated", |b| {
        b.iter(|| {
            let ptr = context.malloc(size);
            criterion::black_box(ptr);
            context.free(ptr);
        });
    });
}

criterion_group!(benches, bench_malloc_free_default_store, bench_malloc_free_dedicated_store);
criterion_main!(benches);
