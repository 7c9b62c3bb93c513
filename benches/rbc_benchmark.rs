//! Benchmarks for the rbc-knn-wgpu library.
//!
//! Host benchmarks always run; device benchmarks are registered only when
//! an adapter is available.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;
use rbc_knn_wgpu::{
    cpu::{build_index_cpu, query_exact_cpu, query_knn_cpu},
    GpuContext, PointMatrix, RbcCompute, RbcConfig, SearchMode,
};
use std::time::Duration;

/// Generates a random point set in `[-100, 100)^dim`.
fn generate_random_points(num_points: usize, dim: usize, seed: u64) -> PointMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..num_points * dim)
        .map(|_| rng.random_range(-100.0..100.0))
        .collect();
    PointMatrix::new(data, dim).expect("finite random points")
}

/// Roughly sqrt(n) representatives, the usual RBC setting.
fn rep_count(n: usize) -> usize {
    ((n as f64).sqrt() as usize).max(1)
}

fn benchmark_build_cpu(c: &mut Criterion) {
    let config = RbcConfig::default();
    let mut group = c.benchmark_group("build_cpu");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    for &num_points in &[10_000, 50_000, 100_000] {
        let db = generate_random_points(num_points, 8, 42);
        group.bench_with_input(BenchmarkId::from_parameter(num_points), &db, |b, db| {
            b.iter(|| {
                let index = build_index_cpu(black_box(db), rep_count(db.rows()), 7, &config).unwrap();
                black_box(index);
            });
        });
    }

    group.finish();
}

fn benchmark_query_cpu(c: &mut Criterion) {
    let config = RbcConfig::default();
    let db = generate_random_points(100_000, 8, 42);
    let queries = generate_random_points(1_000, 8, 43);
    let index = build_index_cpu(&db, rep_count(db.rows()), 7, &config).unwrap();

    let mut group = c.benchmark_group("query_cpu");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    for &budget in &[256usize, 1024, 4096] {
        group.bench_with_input(BenchmarkId::new("budget", budget), &budget, |b, &budget| {
            b.iter(|| {
                let result = query_knn_cpu(&index, black_box(&queries), 10, budget, &config).unwrap();
                black_box(result);
            });
        });
    }
    group.bench_function("exact", |b| {
        b.iter(|| {
            let result = query_exact_cpu(&index, black_box(&queries), 10, &config).unwrap();
            black_box(result);
        });
    });

    group.finish();
}

fn benchmark_query_gpu(c: &mut Criterion) {
    let Ok(gpu) = pollster::block_on(GpuContext::new()) else {
        eprintln!("No GPU available, skipping device benchmarks");
        return;
    };
    println!("Benchmarking on: {}", gpu.device_description());
    let engine = RbcCompute::with_optimal_config(gpu).expect("engine for the selected adapter");

    let mut group = c.benchmark_group("query_gpu");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    for &num_points in &[50_000, 250_000] {
        let db = generate_random_points(num_points, 8, 42);
        let queries = generate_random_points(4_096, 8, 43);
        let index = pollster::block_on(engine.build_index(&db, rep_count(num_points), 7)).unwrap();
        let resident = engine.upload_index(&index).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(num_points), &queries, |b, queries| {
            b.iter(|| {
                pollster::block_on(async {
                    let result = engine
                        .run_query_resident(&index, &resident, black_box(queries), 10, SearchMode::Budgeted(1024))
                        .await
                        .unwrap();
                    black_box(result);
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_build_cpu, benchmark_query_cpu, benchmark_query_gpu);
criterion_main!(benches);
