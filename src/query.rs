//! Query pipeline shared by the host and device executors.
//!
//! A batch moves through `Initialized -> ScoringCandidates -> Reducing ->
//! Finalized`. Candidate representatives are chosen from the
//! queries-by-representatives distance block, a [`ComputePlan`] spreads the
//! owned ranges over work items, every item fills one top-k slot, and the
//! slots of each query are merged into its final ranked list.

use crate::{
    distance::squared_distance,
    error::{RbcError, Result},
    index::RbcIndex,
    plan::ComputePlan,
    range::{range_search, RangeResult},
    select::{running_min, sort_block, BoundedHeap, TopKArena},
    types::{Neighbor, PointMatrix, WorkItem},
};
use log::{debug, warn};
use rayon::prelude::*;
use std::time::Instant;

/// How candidate representatives are chosen for each query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    /// Scan the nearest representatives until roughly this many points are covered.
    Budgeted(usize),
    /// Scan every representative the triangle inequality cannot rule out.
    Exact,
}

/// Lifecycle of a query batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPhase {
    /// Inputs validated, candidate sets being chosen
    Initialized,
    /// Work items computing distances into their top-k slots
    ScoringCandidates,
    /// Per-query slots being merged
    Reducing,
    /// Ranked lists written
    Finalized,
}

/// Tracks the phase of one batch and rejects out-of-order transitions.
#[derive(Debug)]
pub struct QueryBatch {
    phase: QueryPhase,
    started: Instant,
    num_queries: usize,
}

impl QueryBatch {
    /// Starts a batch of `num_queries` queries.
    pub fn new(num_queries: usize) -> Self {
        Self {
            phase: QueryPhase::Initialized,
            started: Instant::now(),
            num_queries,
        }
    }

    /// Current phase.
    #[inline]
    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    /// Moves to `next`. Scoring may be re-entered for further chunks.
    pub fn advance(&mut self, next: QueryPhase) -> Result<()> {
        use QueryPhase::*;
        let allowed = matches!(
            (self.phase, next),
            (Initialized, ScoringCandidates)
                | (ScoringCandidates, ScoringCandidates)
                | (ScoringCandidates, Reducing)
                | (Reducing, Finalized)
        );
        if !allowed {
            return Err(RbcError::ComputeError(format!(
                "invalid query phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        debug!(
            "Query batch ({} queries) {:?} -> {:?} at {:.2} ms",
            self.num_queries,
            self.phase,
            next,
            self.elapsed_ms()
        );
        self.phase = next;
        Ok(())
    }

    /// Milliseconds since the batch started.
    pub fn elapsed_ms(&self) -> f32 {
        self.started.elapsed().as_secs_f32() * 1000.0
    }
}

/// Checks queries and `k` against the index before any work is launched.
pub fn validate_query(index: &RbcIndex, queries: &PointMatrix, k: usize) -> Result<()> {
    if queries.is_empty() {
        return Err(RbcError::EmptyInput("queries"));
    }
    if queries.dim() != index.dim() {
        return Err(RbcError::shape(
            format!("queries of dimension {}", index.dim()),
            format!("dimension {}", queries.dim()),
        ));
    }
    if k == 0 || k > index.len() {
        return Err(RbcError::InvalidK { k, n: index.len() });
    }
    Ok(())
}

/// Weighted count the range kernel must reach; a budget below `k` is raised to `k`.
#[inline]
pub fn candidate_target(k: usize, budget: usize) -> u64 {
    budget.max(k) as u64
}

/// Representatives within each query's radius.
pub fn select_in_range(dists: &[f32], reps: usize, ranges: &[RangeResult]) -> Vec<Vec<u32>> {
    dists
        .par_chunks(reps)
        .zip(ranges.par_iter())
        .map(|(row, range)| range_search(row, range.radius))
        .collect()
}

/// Representatives that may own one of the query's `k` nearest neighbors.
///
/// The k-th closest representative is itself a database point, so its
/// distance `gamma` bounds the k-th neighbor distance. A representative `r`
/// with covering radius `rho` can then be skipped when `d(q, r) - rho > gamma`.
pub fn select_exact(dists: &[f32], reps: usize, radii: &[f32], k: usize) -> Vec<Vec<u32>> {
    let radii: Vec<f32> = radii.iter().map(|r| r.max(0.0).sqrt()).collect();
    dists
        .par_chunks(reps)
        .map(|row| {
            let gamma = if reps >= k {
                let mut sorted = row.to_vec();
                let (_, kth, _) = sorted.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
                (*kth).max(0.0).sqrt()
            } else {
                f32::INFINITY
            };
            let slack = gamma * 1e-5 + 1e-6;
            row.iter()
                .zip(&radii)
                .enumerate()
                .filter(|(_, (d, rho))| d.max(0.0).sqrt() - **rho <= gamma + slack)
                .map(|(r, _)| r as u32)
                .collect()
        })
        .collect()
}

/// Scores one work item on the host and writes its top-k into `slot`.
///
/// Distances are computed `width` at a time, each block is sorted with the
/// network and offered to the item's heap in ascending order. With `k == 1`
/// a running minimum replaces the heap.
pub fn score_item(query: &[f32], database: &PointMatrix, item: &WorkItem, width: usize, slot: &mut [Neighbor]) {
    let end = item.start + item.len;

    if slot.len() == 1 {
        let mut best = None;
        for pos in item.start..end {
            let d = squared_distance(query, database.row(pos as usize));
            best = running_min(best, Neighbor::new(d, pos));
        }
        slot[0] = best.unwrap_or_else(Neighbor::empty);
        return;
    }

    let mut heap = BoundedHeap::new(slot.len());
    let mut block = Vec::with_capacity(width);
    let mut scratch = Vec::with_capacity(width);
    let mut pos = item.start;
    while pos < end {
        let block_end = (pos + width as u32).min(end);
        block.clear();
        let threshold = heap.threshold();
        for p in pos..block_end {
            let d = squared_distance(query, database.row(p as usize));
            if d <= threshold {
                block.push(Neighbor::new(d, p));
            }
        }
        if !block.is_empty() {
            sort_block(&block, width, &mut scratch);
            heap.push_sorted(&scratch);
        }
        pos = block_end;
    }
    TopKArena::fill_slot(slot, &heap.into_sorted_vec());
}

/// Merges each query's slots and maps reordered positions to original rows.
pub fn finalize(index: &RbcIndex, arena: &TopKArena, plan: &ComputePlan) -> Vec<Vec<Neighbor>> {
    plan.query_slots
        .par_iter()
        .map(|slots| {
            let mut list = arena.reduce(slots.clone());
            for n in &mut list {
                n.index = index.original_index(n.index);
            }
            list
        })
        .collect()
}

/// Logs queries whose candidate set turned out empty.
pub fn report_coverage_gaps(neighbors: &[Vec<Neighbor>]) {
    let gaps = neighbors.iter().filter(|list| list.is_empty()).count();
    if gaps > 0 {
        warn!(
            "{} of {} queries found no candidates; retry them with a larger candidate budget",
            gaps,
            neighbors.len()
        );
    }
}

/// Logs queries whose radius had to cover every representative.
pub fn report_clipped_radii(clipped: usize, queries: usize) {
    if clipped > 0 {
        warn!(
            "{} of {} queries hold less weight than their candidate target; radius covers all representatives",
            clipped, queries
        );
    }
}
