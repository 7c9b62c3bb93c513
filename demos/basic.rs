//! Basic example demonstrating rbc-knn-wgpu usage.
//!
//! Builds an index over a handful of 2D points with two hand-picked
//! representatives and asks for the two nearest neighbors of a query.

use anyhow::Result;
use rbc_knn_wgpu::{GpuContext, PointMatrix, RbcCompute};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    println!("Initializing GPU context...");
    let gpu = GpuContext::new().await?;
    println!("Using GPU: {}", gpu.device_description());
    let engine = RbcCompute::with_optimal_config(gpu)?;

    // Three points near the origin, one far away
    let database = PointMatrix::from_rows(&[
        [0.0, 0.0], // Point 0
        [1.0, 0.0], // Point 1
        [0.0, 1.0], // Point 2
        [5.0, 5.0], // Point 3
    ])?;
    let index = engine.build_index_from_representatives(&database, &[0, 3]).await?;

    println!("\nOwned sets:");
    for r in 0..index.num_representatives() {
        println!(
            "Representative {} (point {}): {} points, squared radius {:.4}",
            r,
            index.representative_ids()[r],
            index.owned_range(r).len,
            index.radii()[r]
        );
    }

    let queries = PointMatrix::from_rows(&[[0.1, 0.1], [4.0, 4.5]])?;
    let result = engine.query(&index, &queries, 2, 4).await?;

    println!("\nResults:");
    println!("========");
    for q in 0..queries.rows() {
        for (rank, n) in result.neighbors_of(q)?.iter().enumerate() {
            println!(
                "Query {} #{}: point {} at distance {:.4}",
                q,
                rank + 1,
                n.index,
                n.distance()
            );
        }
    }

    if let Some(time) = result.compute_time_ms {
        println!("\nComputation time: {:.2} ms", time);
    }
    println!("Candidates scored: {}", result.stats.candidates_scored);

    Ok(())
}
