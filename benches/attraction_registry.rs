//! Benchmark for attraction registry lookups
//!
//! Candidate selection runs on every read and write request, so it is
//! measured against a registry of 1000 pools.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hsm_flush_control::attraction::{AttractionRegistry, PoolAttraction, StorageClassSelector};
use hsm_flush_control::domain::ports::FileAttributes;
use std::sync::Arc;

fn populated_registry(pools: usize) -> Arc<AttractionRegistry> {
    let registry = AttractionRegistry::new();
    for i in 0..pools {
        let pool = format!("pool-{:04}", i);
        let attractions = vec![
            PoolAttraction::exact("osm", format!("class-{}", i % 20), (i % 7) as i32 + 1, (i % 5) as i32),
            PoolAttraction::new(
                "osm",
                StorageClassSelector::template([("experiment", format!("exp-{}", i % 10))]),
                1,
                1,
            ),
        ];
        registry.add_pool_info(pool.clone(), pool.as_str(), attractions);
    }
    registry
}

fn bench_add_pool_info(c: &mut Criterion) {
    let mut group = c.benchmark_group("attraction_registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add_pool_info", |b| {
        let registry = AttractionRegistry::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let pool = format!("pool-{}", counter % 1000);
            registry.add_pool_info(
                black_box(pool.clone()),
                pool.as_str(),
                vec![PoolAttraction::exact("osm", "raw", 10, 10)],
            );
        });
    });

    group.finish();
}

fn bench_candidates_by_class(c: &mut Criterion) {
    let mut group = c.benchmark_group("attraction_registry");
    group.throughput(Throughput::Elements(1));

    let registry = populated_registry(1000);

    group.bench_function("sorted_candidates_by_class", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let class = format!("class-{}", counter % 20);
            black_box(registry.sorted_candidates_by_class("OSM", black_box(&class), true));
        });
    });

    group.finish();
}

fn bench_candidates_for_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("attraction_registry");
    group.throughput(Throughput::Elements(1));

    let registry = populated_registry(1000);
    let file = FileAttributes::new("osm", "class-3").with_attribute("experiment", "exp-3");

    group.bench_function("candidates_for_file", |b| {
        b.iter(|| {
            black_box(registry.candidates_for_file(black_box(&file), false));
        });
    });

    group.finish();
}

fn bench_concurrent_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("attraction_registry");
    group.throughput(Throughput::Elements(100));

    let registry = populated_registry(1000);
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_lookups", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let reg = registry.clone();
                    handles.push(tokio::spawn(async move {
                        let class = format!("class-{}", i % 20);
                        reg.sorted_candidates_by_class("osm", &class, i % 2 == 0).len()
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_add_pool_info,
    bench_candidates_by_class,
    bench_candidates_for_file,
    bench_concurrent_lookups,
);
criterion_main!(benches);
