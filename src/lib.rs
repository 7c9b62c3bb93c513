//! Random Ball Cover nearest-neighbor search on wgpu compute shaders.
//!
//! An [`RbcIndex`] samples a set of representatives from the database,
//! assigns every point to its nearest representative and stores each owned
//! set contiguously. Queries first compare against the representatives,
//! then scan only the owned sets of the few representatives that matter,
//! either within a candidate budget (approximate) or with triangle
//! inequality pruning (exact).
//!
//! The device executor ([`RbcCompute`]) runs distances, radius search,
//! assignment and top-k scoring as WGSL kernels; the host executor
//! ([`cpu`]) runs the same pipeline on rayon.
//!
//! # Example
//!
//! ```rust,no_run
//! use rbc_knn_wgpu::{build_index, query_knn, GpuContext, PointMatrix};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let gpu = GpuContext::new().await?;
//!
//! let database = PointMatrix::from_rows(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0]])?;
//! let index = build_index(&gpu, &database, 2, 42).await?;
//!
//! let queries = PointMatrix::from_rows(&[[0.1, 0.1]])?;
//! let result = query_knn(&gpu, &index, &queries, 2, 4).await?;
//! println!("Neighbors: {:?}", result.neighbors_of(0)?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cpu;
pub mod device;
pub mod distance;
pub mod engine;
pub mod error;
pub mod index;
pub mod plan;
pub mod query;
pub mod range;
pub mod select;
pub mod shaders;
pub mod types;

pub use device::GpuContext;
pub use engine::{DeviceIndex, RbcCompute};
pub use error::{RbcError, Result};
pub use index::RbcIndex;
pub use query::SearchMode;
pub use types::{KnnResult, Neighbor, NnResult, PointMatrix, QueryStats, RbcConfig};

use log::warn;

/// Builds an index on the device with an optimal configuration.
///
/// # Arguments
/// * `context` - The GPU context to use
/// * `database` - Points to index
/// * `rep_count` - Number of representatives to sample
/// * `seed` - Seed of the representative sampler
pub async fn build_index(context: &GpuContext, database: &PointMatrix, rep_count: usize, seed: u64) -> Result<RbcIndex> {
    let compute = RbcCompute::with_optimal_config(context.clone())?;
    compute.build_index(database, rep_count, seed).await
}

/// Approximate kNN on the device with an optimal configuration.
///
/// Each query scans the representatives nearest to it until about
/// `candidate_budget` points are covered.
pub async fn query_knn(
    context: &GpuContext,
    index: &RbcIndex,
    queries: &PointMatrix,
    k: usize,
    candidate_budget: usize,
) -> Result<KnnResult> {
    let compute = RbcCompute::with_optimal_config(context.clone())?;
    compute.query(index, queries, k, candidate_budget).await
}

/// Exact kNN on the device with an optimal configuration.
pub async fn query_exact(context: &GpuContext, index: &RbcIndex, queries: &PointMatrix, k: usize) -> Result<KnnResult> {
    let compute = RbcCompute::with_optimal_config(context.clone())?;
    compute.query_exact(index, queries, k).await
}

/// Builds an index on the best adapter, or on the host when none is usable.
pub async fn build_index_auto(database: &PointMatrix, rep_count: usize, seed: u64) -> Result<RbcIndex> {
    match GpuContext::new().await {
        Ok(gpu) => build_index(&gpu, database, rep_count, seed).await,
        Err(e) => {
            warn!("{}; building on the host", e);
            cpu::build_index_cpu(database, rep_count, seed, &RbcConfig::default())
        }
    }
}

/// Approximate kNN on the best adapter, or on the host when none is usable
/// or `k` exceeds the device limit.
pub async fn query_knn_auto(
    index: &RbcIndex,
    queries: &PointMatrix,
    k: usize,
    candidate_budget: usize,
) -> Result<KnnResult> {
    let config = RbcConfig::default();
    if k as u32 <= config.max_gpu_k {
        match GpuContext::new().await {
            Ok(gpu) => return query_knn(&gpu, index, queries, k, candidate_budget).await,
            Err(e) => warn!("{}; querying on the host", e),
        }
    }
    cpu::query_knn_cpu(index, queries, k, candidate_budget, &config)
}

/// Blocking form of [`build_index_auto`] for callers without an async runtime.
pub fn build_index_blocking(database: &PointMatrix, rep_count: usize, seed: u64) -> Result<RbcIndex> {
    pollster::block_on(build_index_auto(database, rep_count, seed))
}

/// Blocking form of [`query_knn_auto`].
pub fn query_knn_blocking(
    index: &RbcIndex,
    queries: &PointMatrix,
    k: usize,
    candidate_budget: usize,
) -> Result<KnnResult> {
    pollster::block_on(query_knn_auto(index, queries, k, candidate_budget))
}

/// Library version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> PointMatrix {
        PointMatrix::from_rows(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0]]).unwrap()
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_auto_paths_answer_small_scenario() {
        let database = square();
        let index = build_index_auto(&database, 2, 7).await.unwrap();
        assert_eq!(index.len(), 4);
        let queries = PointMatrix::from_rows(&[[0.1, 0.1]]).unwrap();
        let result = query_knn_auto(&index, &queries, 1, 4).await.unwrap();
        assert_eq!(result.neighbors_of(0).unwrap()[0].index, 0);
    }

    #[test]
    fn test_blocking_wrappers() {
        let index = build_index_blocking(&square(), 1, 3).unwrap();
        let queries = PointMatrix::from_rows(&[[4.0, 4.0]]).unwrap();
        let result = query_knn_blocking(&index, &queries, 1, 4).unwrap();
        assert_eq!(result.neighbors_of(0).unwrap()[0].index, 3);
    }

    #[tokio::test]
    async fn test_auto_query_falls_back_for_large_k() {
        let rows: Vec<[f32; 1]> = (0..40).map(|i| [i as f32]).collect();
        let database = PointMatrix::from_rows(&rows).unwrap();
        let index = cpu::build_index_cpu(&database, 5, 1, &RbcConfig::default()).unwrap();
        let result = query_knn_auto(&index, &database.gather(&[0]), 35, 40).await.unwrap();
        assert_eq!(result.neighbors_of(0).unwrap().len(), 35);
    }
}
