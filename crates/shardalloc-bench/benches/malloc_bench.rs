//! Allocator benchmarks: shardalloc against the system allocator.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, 131072];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("shardalloc", size), &size, |b, &sz| {
            b.iter(|| {
                let p = shardalloc_core::malloc(sz);
                criterion::black_box(p);
                // SAFETY: freed exactly once per iteration.
                unsafe { shardalloc_core::free(p) };
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("shardalloc_1000x64B", |b| {
        let mut ptrs = Vec::with_capacity(1000);
        b.iter(|| {
            for _ in 0..1000 {
                ptrs.push(shardalloc_core::malloc(64));
            }
            criterion::black_box(&ptrs);
            for p in ptrs.drain(..) {
                // SAFETY: freed exactly once.
                unsafe { shardalloc_core::free(p) };
            }
        });
    });

    group.bench_function("system_1000x64B", |b| {
        b.iter(|| {
            let allocs: Vec<Vec<u8>> = (0..1000).map(|_| vec![0u8; 64]).collect();
            criterion::black_box(allocs);
        });
    });

    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_growth");

    group.bench_function("shardalloc_doubling_to_1MiB", |b| {
        b.iter(|| {
            let mut p = shardalloc_core::malloc(16);
            let mut size = 16;
            while size < (1 << 20) {
                size *= 2;
                // SAFETY: standard realloc chain; the final pointer is
                // freed below.
                p = unsafe { shardalloc_core::realloc(p, size) };
            }
            // SAFETY: freed exactly once.
            unsafe { shardalloc_core::free(p) };
        });
    });

    group.bench_function("system_doubling_to_1MiB", |b| {
        b.iter(|| {
            let mut v: Vec<u8> = Vec::with_capacity(16);
            while v.capacity() < (1 << 20) {
                v.reserve_exact(v.capacity());
            }
            criterion::black_box(v);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_realloc_growth
);
criterion_main!(benches);
