//! Host range/radius kernel.
//!
//! For every row of a distance matrix, [`find_range`] bisects the interval
//! `[0, max(row)]` a fixed number of times, keeping the upper end at a radius
//! whose weighted count reaches the target. The result is approximate but
//! never under-covers: `count(radius) >= min(target, total)`.
//!
//! `range.wgsl` runs the same bisection on the device, one workgroup per row.

use crate::error::{RbcError, Result};
use rayon::prelude::*;

/// Outcome of a radius search on one row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeResult {
    /// Squared-distance threshold
    pub radius: f32,
    /// Weighted count of entries `<= radius`
    pub count: u64,
    /// The row held less weight than the target; `radius` covers everything
    pub clipped: bool,
}

impl RangeResult {
    /// Rebuilds a result from the device outputs.
    pub fn from_device(radius: f32, count: u32, target: u64) -> Self {
        Self {
            radius,
            count: count as u64,
            clipped: (count as u64) < target,
        }
    }
}

/// Weighted count of entries `<= radius`. Missing weights count as 1.
#[inline]
pub fn range_count(row: &[f32], weights: Option<&[u32]>, radius: f32) -> u64 {
    match weights {
        Some(w) => row
            .iter()
            .zip(w)
            .filter(|(d, _)| **d <= radius)
            .map(|(_, w)| *w as u64)
            .sum(),
        None => row.iter().filter(|d| **d <= radius).count() as u64,
    }
}

/// Columns of `row` within `radius`.
pub fn range_search(row: &[f32], radius: f32) -> Vec<u32> {
    row.iter()
        .enumerate()
        .filter(|(_, d)| **d <= radius)
        .map(|(j, _)| j as u32)
        .collect()
}

/// Finds a radius whose weighted count is close to, and at least, `target`.
pub fn find_range(row: &[f32], weights: Option<&[u32]>, target: u64, iterations: u32) -> RangeResult {
    if row.is_empty() {
        return RangeResult {
            radius: 0.0,
            count: 0,
            clipped: target > 0,
        };
    }

    let max = row.iter().copied().fold(0.0f32, f32::max);
    let total = range_count(row, weights, max);

    let mut lo = 0.0f32;
    let mut hi = max;
    let mut count_hi = total;
    for _ in 0..iterations {
        let mid = 0.5 * (lo + hi);
        let c = range_count(row, weights, mid);
        if c >= target {
            hi = mid;
            count_hi = c;
        } else {
            lo = mid;
        }
    }

    RangeResult {
        radius: hi,
        count: count_hi,
        clipped: total < target,
    }
}

/// Runs [`find_range`] on every row of a `rows x cols` matrix in parallel.
///
/// # Errors
/// `ShapeMismatch` if `dists` is not `rows x cols` or `weights` is not `cols` long.
pub fn find_ranges(
    dists: &[f32],
    cols: usize,
    weights: Option<&[u32]>,
    target: u64,
    iterations: u32,
) -> Result<Vec<RangeResult>> {
    if cols == 0 || dists.len() % cols != 0 {
        return Err(RbcError::shape(
            format!("rows x {} distance matrix", cols),
            format!("{} entries", dists.len()),
        ));
    }
    if let Some(w) = weights {
        if w.len() != cols {
            return Err(RbcError::shape(
                format!("{} weights", cols),
                format!("{} weights", w.len()),
            ));
        }
    }

    Ok(dists
        .par_chunks(cols)
        .map(|row| find_range(row, weights, target, iterations))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_under_covers() {
        let row: Vec<f32> = (0..100).map(|i| ((i * 37) % 101) as f32 * 0.5).collect();
        for target in [1u64, 5, 17, 50, 99, 100] {
            let r = find_range(&row, None, target, 24);
            assert!(!r.clipped);
            assert!(r.count >= target, "target {} got {}", target, r.count);
            assert_eq!(range_count(&row, None, r.radius), r.count);
        }
    }

    #[test]
    fn test_radius_is_monotone_in_target() {
        let row: Vec<f32> = (0..64).map(|i| (i as f32).powi(2)).collect();
        let mut last = 0.0;
        for target in 1..=64u64 {
            let r = find_range(&row, None, target, 24);
            assert!(r.radius >= last);
            last = r.radius;
        }
    }

    #[test]
    fn test_clipping_when_target_exceeds_total() {
        let row = [1.0, 4.0, 9.0];
        let r = find_range(&row, None, 10, 24);
        assert!(r.clipped);
        assert_eq!(r.radius, 9.0);
        assert_eq!(r.count, 3);
    }

    #[test]
    fn test_weighted_count() {
        // two owned-set weights: the nearest column alone satisfies 3
        let row = [0.02, 48.02];
        let weights = [3u32, 1];
        let r = find_range(&row, Some(&weights), 3, 24);
        assert_eq!(r.count, 3);
        assert!(r.radius >= 0.02 && r.radius < 48.02);
        assert_eq!(range_search(&row, r.radius), vec![0]);
    }

    #[test]
    fn test_empty_row() {
        let r = find_range(&[], None, 1, 8);
        assert!(r.clipped);
        assert_eq!(r.count, 0);
    }

    #[test]
    fn test_find_ranges_shapes() {
        let dists = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let out = find_ranges(&dists, 3, None, 2, 16).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.count >= 2));
        assert!(find_ranges(&dists, 4, None, 2, 16).is_err());
        assert!(find_ranges(&dists, 3, Some(&[1, 1]), 2, 16).is_err());
    }
}
