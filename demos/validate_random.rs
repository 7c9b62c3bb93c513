use anyhow::{ensure, Result};
use rand::Rng;
use rbc_knn_wgpu::{cpu, distance::squared_distance, GpuContext, PointMatrix, RbcCompute, RbcConfig};
use std::time::Instant;

/// Naive reference: sorted squared distances of the `k` nearest points.
fn brute_force_knn(database: &PointMatrix, query: &[f32], k: usize) -> Vec<f32> {
    let mut dists: Vec<f32> = (0..database.rows())
        .map(|i| squared_distance(query, database.row(i)))
        .collect();
    dists.sort_by(|a, b| a.total_cmp(b));
    dists.truncate(k);
    dists
}

fn random_matrix(rng: &mut impl Rng, rows: usize, dim: usize) -> Result<PointMatrix> {
    let data = (0..rows * dim).map(|_| rng.random::<f32>()).collect();
    Ok(PointMatrix::new(data, dim)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let num_points = 20_000; // adjustable
    let num_queries = 500;
    let dim = 16;
    let k = 10;
    println!("Generating {} random points in the unit cube (dim {})...", num_points, dim);
    let mut rng = rand::rng();
    let database = random_matrix(&mut rng, num_points, dim)?;
    let queries = random_matrix(&mut rng, num_queries, dim)?;
    let reps = (num_points as f64).sqrt() as usize;

    // Brute-force reference
    let t0 = Instant::now();
    let reference: Vec<Vec<f32>> = (0..num_queries)
        .map(|q| brute_force_knn(&database, queries.row(q), k))
        .collect();
    println!("Brute force completed in {:.2} ms", t0.elapsed().as_secs_f32() * 1000.0);

    // Prefer the device, fall back to the host executor
    let t1 = Instant::now();
    let result = match GpuContext::new().await {
        Ok(gpu) => {
            println!("Using GPU: {}", gpu.device_description());
            let engine = RbcCompute::with_optimal_config(gpu)?;
            let index = engine.build_index(&database, reps, 42).await?;
            engine.query_exact(&index, &queries, k).await?
        }
        Err(e) => {
            println!("{}; using the host executor", e);
            let config = RbcConfig::default();
            let index = cpu::build_index_cpu(&database, reps, 42, &config)?;
            cpu::query_exact_cpu(&index, &queries, k, &config)?
        }
    };
    println!(
        "RBC exact search completed in {:.2} ms (query time: {:.2?} ms)",
        t1.elapsed().as_secs_f32() * 1000.0,
        result.compute_time_ms
    );
    println!(
        "Scored {} candidates ({:.1}% of brute force)",
        result.stats.candidates_scored,
        100.0 * result.stats.candidates_scored as f64 / (num_points * num_queries) as f64
    );

    // Verify correctness & print some sample values
    let mut max_abs_err = 0.0f32;
    for (q, want) in reference.iter().enumerate() {
        let got = result.neighbors_of(q)?;
        ensure!(got.len() == k, "query {} returned {} neighbors", q, got.len());
        for (g, w) in got.iter().zip(want) {
            max_abs_err = max_abs_err.max((g.distance_sq - w).abs());
        }
        if q < 5 {
            println!(
                "Query {:3}: nearest {:.6} (reference {:.6})",
                q, got[0].distance_sq, want[0]
            );
        }
    }

    println!("\nMax absolute error: {:.6}", max_abs_err);
    ensure!(max_abs_err < 1e-3, "RBC results deviate from the brute-force reference");

    println!("Validation passed!\n");

    Ok(())
}
