//! Computation plan builder.
//!
//! Turns "query `q` must be compared against the owned ranges of these
//! representatives" into a flat list of [`WorkItem`]s of near-equal size.
//! Every item names its query, the reordered slice it scores and the output
//! column it owns, so independent workers can execute items in any order and
//! still leave each query's partial results in one contiguous run of slots.

use crate::{
    error::{RbcError, Result},
    types::{OwnedRange, RbcConfig, WorkItem},
};
use log::debug;
use std::ops::Range;

/// Load-balanced schedule for one query batch.
#[derive(Clone, Debug, Default)]
pub struct ComputePlan {
    /// Work items ordered by query; `items[i].out_col == i`
    pub items: Vec<WorkItem>,
    /// Output slots owned by each query
    pub query_slots: Vec<Range<usize>>,
    /// Maximum slice length of a work item
    pub granularity: usize,
    /// Candidate comparisons across the whole batch
    pub total_work: u64,
}

impl ComputePlan {
    /// Builds the plan for `candidates[q]` = representatives query `q` must scan.
    ///
    /// A query without any owned points to scan gets an empty slot range.
    ///
    /// # Errors
    /// `ShapeMismatch` if a representative id is out of range.
    pub fn build(candidates: &[Vec<u32>], owned: &[OwnedRange], config: &RbcConfig) -> Result<Self> {
        let mut per_query: Vec<Vec<u32>> = Vec::with_capacity(candidates.len());
        let mut total_work = 0u64;
        for reps in candidates {
            let mut reps = reps.clone();
            reps.sort_unstable();
            reps.dedup();
            if let Some(&bad) = reps.iter().find(|&&r| r as usize >= owned.len()) {
                return Err(RbcError::shape(
                    format!("representative id below {}", owned.len()),
                    bad,
                ));
            }
            total_work += reps.iter().map(|&r| owned[r as usize].len as u64).sum::<u64>();
            per_query.push(reps);
        }

        let granularity = (total_work.div_ceil(config.target_work_items as u64) as usize)
            .max(config.min_chunk);

        let chunk = granularity.min(u32::MAX as usize) as u32;
        let mut items = Vec::new();
        let mut query_slots = Vec::with_capacity(candidates.len());
        for (q, reps) in per_query.iter().enumerate() {
            let first = items.len();
            for &rep in reps {
                let range = owned[rep as usize];
                let mut offset = 0u32;
                while offset < range.len {
                    let len = (range.len - offset).min(chunk);
                    items.push(WorkItem {
                        query: q as u32,
                        rep,
                        start: range.start + offset,
                        len,
                        out_col: items.len() as u32,
                        _padding: [0; 3],
                    });
                    offset += len;
                }
            }
            query_slots.push(first..items.len());
        }

        debug!(
            "Computation plan: {} queries, {} candidates, {} work items, granularity {}",
            candidates.len(),
            total_work,
            items.len(),
            granularity
        );

        Ok(Self {
            items,
            query_slots,
            granularity,
            total_work,
        })
    }

    /// Number of output slots (one per work item).
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.items.len()
    }

    /// Candidate comparisons scheduled for query `q`.
    pub fn query_work(&self, q: usize) -> u64 {
        self.items[self.query_slots[q].clone()]
            .iter()
            .map(|item| item.len as u64)
            .sum()
    }

    /// True when query `q` has nothing to scan.
    #[inline]
    pub fn is_uncovered(&self, q: usize) -> bool {
        self.query_slots[q].is_empty()
    }
}
