//! Host executor using rayon parallelism.
//!
//! Runs the same pipeline as [`crate::engine::RbcCompute`] with the host
//! kernels, so results can be produced (and checked) without a GPU adapter.

use crate::{
    distance::distance_matrix_alloc,
    error::Result,
    index::{assign_owners, select_representatives, validate_build, validate_representatives, RbcIndex},
    plan::ComputePlan,
    query::{
        candidate_target, finalize, report_clipped_radii, report_coverage_gaps, score_item, select_exact, select_in_range,
        validate_query, QueryBatch, QueryPhase, SearchMode,
    },
    range::find_ranges,
    select::TopKArena,
    types::{KnnResult, NnResult, PointMatrix, QueryStats, RbcConfig},
};
use log::info;
use rayon::prelude::*;
use std::time::Instant;

/// Builds an index over `database` with `rep_count` randomly sampled representatives.
pub fn build_index_cpu(database: &PointMatrix, rep_count: usize, seed: u64, config: &RbcConfig) -> Result<RbcIndex> {
    config.checked()?;
    validate_build(database, rep_count)?;
    let rep_ids = select_representatives(database.rows(), rep_count, seed);
    build_from_ids(database, rep_ids, config)
}

/// Builds an index using the given database rows as representatives.
pub fn build_index_from_representatives_cpu(
    database: &PointMatrix,
    rep_ids: &[usize],
    config: &RbcConfig,
) -> Result<RbcIndex> {
    config.checked()?;
    validate_representatives(database, rep_ids)?;
    build_from_ids(database, rep_ids.to_vec(), config)
}

fn build_from_ids(database: &PointMatrix, rep_ids: Vec<usize>, config: &RbcConfig) -> Result<RbcIndex> {
    let start = Instant::now();
    let reps = database.gather(&rep_ids);
    let dists = distance_matrix_alloc(&reps, database)?;
    let (owners, owner_dists) = assign_owners(&dists, rep_ids.len(), database.rows());
    let index = RbcIndex::assemble(database, rep_ids, owners, owner_dists, config)?;
    info!(
        "Built index over {} points with {} representatives in {:.2} ms (host)",
        index.len(),
        index.num_representatives(),
        start.elapsed().as_secs_f32() * 1000.0
    );
    Ok(index)
}

/// Approximate kNN: each query scans the representatives nearest to it until
/// about `candidate_budget` points are covered.
pub fn query_knn_cpu(
    index: &RbcIndex,
    queries: &PointMatrix,
    k: usize,
    candidate_budget: usize,
    config: &RbcConfig,
) -> Result<KnnResult> {
    run_query(index, queries, k, SearchMode::Budgeted(candidate_budget), config)
}

/// Exact kNN using triangle-inequality pruning of representatives.
pub fn query_exact_cpu(index: &RbcIndex, queries: &PointMatrix, k: usize, config: &RbcConfig) -> Result<KnnResult> {
    run_query(index, queries, k, SearchMode::Exact, config)
}

/// Single nearest neighbor per query.
pub fn query_nn_cpu(
    index: &RbcIndex,
    queries: &PointMatrix,
    candidate_budget: usize,
    config: &RbcConfig,
) -> Result<NnResult> {
    run_query(index, queries, 1, SearchMode::Budgeted(candidate_budget), config).map(NnResult::from)
}

/// Runs a query batch in the given search mode.
pub fn run_query(
    index: &RbcIndex,
    queries: &PointMatrix,
    k: usize,
    mode: SearchMode,
    config: &RbcConfig,
) -> Result<KnnResult> {
    config.checked()?;
    validate_query(index, queries, k)?;
    let mut batch = QueryBatch::new(queries.rows());
    let reps = index.num_representatives();

    let dists = distance_matrix_alloc(queries, index.representatives())?;
    let mut clipped_radii = 0;
    let candidates = match mode {
        SearchMode::Budgeted(budget) => {
            let weights = index.owned_sizes();
            let ranges = find_ranges(
                &dists,
                reps,
                Some(&weights),
                candidate_target(k, budget),
                config.range_iterations,
            )?;
            clipped_radii = ranges.iter().filter(|r| r.clipped).count();
            select_in_range(&dists, reps, &ranges)
        }
        SearchMode::Exact => select_exact(&dists, reps, index.radii(), k),
    };

    let plan = ComputePlan::build(&candidates, index.owned_ranges(), config)?;

    batch.advance(QueryPhase::ScoringCandidates)?;
    let mut arena = TopKArena::new(plan.num_slots(), k);
    let database = index.reordered_database();
    arena
        .as_mut_slice()
        .par_chunks_mut(k)
        .zip(plan.items.par_iter())
        .for_each(|(slot, item)| {
            score_item(queries.row(item.query as usize), database, item, config.merge_width, slot);
        });

    batch.advance(QueryPhase::Reducing)?;
    let neighbors = finalize(index, &arena, &plan);

    batch.advance(QueryPhase::Finalized)?;
    report_coverage_gaps(&neighbors);
    report_clipped_radii(clipped_radii, queries.rows());

    let compute_time_ms = batch.elapsed_ms();
    info!(
        "Answered {} queries (k = {}, {:?}) in {:.2} ms (host)",
        queries.rows(),
        k,
        mode,
        compute_time_ms
    );

    Ok(KnnResult {
        k,
        neighbors,
        stats: QueryStats {
            candidates_scored: plan.total_work,
            work_items: plan.items.len(),
            granularity: plan.granularity,
            clipped_radii,
        },
        compute_time_ms: Some(compute_time_ms),
    })
}
