//! Type definitions for host and GPU data structures.
//!
//! The `Pod` structs in this module are shared with the WGSL kernels, so
//! their field order and padding must match the shader declarations.

use crate::error::{RbcError, Result};
use bytemuck::{Pod, Zeroable};

/// Distance stored in unused top-k slots. Matches `EMPTY_DIST` in the shaders.
pub const EMPTY_DISTANCE: f32 = 3.0e38;

/// Index stored in unused top-k slots. Matches `EMPTY_IDX` in the shaders.
pub const EMPTY_INDEX: u32 = u32::MAX;

/// Largest squared norm a point may have.
///
/// Any squared distance between two accepted points stays below
/// `4 * MAX_SQUARED_NORM`, well under [`EMPTY_DISTANCE`].
pub const MAX_SQUARED_NORM: f32 = EMPTY_DISTANCE / 8.0;

/// Largest `k` the `plan_knn` kernel can hold in registers.
pub const MAX_GPU_K: u32 = 32;

fn squared_norm(row: &[f32]) -> f64 {
    row.iter().map(|&v| v as f64 * v as f64).sum()
}

/// Dense row-major matrix of D-dimensional points.
#[derive(Clone, Debug, PartialEq)]
pub struct PointMatrix {
    data: Vec<f32>,
    rows: usize,
    dim: usize,
}

impl PointMatrix {
    /// Wraps a flat row-major buffer `[x00, x01, .., x10, ..]`.
    ///
    /// # Errors
    /// `EmptyInput` for zero dimensions, `ShapeMismatch` when the buffer length
    /// is not a multiple of `dim`, `InvalidValues` for NaN or infinite values
    /// and for rows whose squared norm exceeds [`MAX_SQUARED_NORM`].
    pub fn new(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(RbcError::EmptyInput("dimension"));
        }
        if data.len() % dim != 0 {
            return Err(RbcError::shape(
                format!("a multiple of {} values", dim),
                format!("{} values", data.len()),
            ));
        }
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(RbcError::InvalidValues(pos / dim));
        }
        if let Some(row) = data.chunks_exact(dim).position(|row| squared_norm(row) > MAX_SQUARED_NORM as f64) {
            return Err(RbcError::InvalidValues(row));
        }
        let rows = data.len() / dim;
        Ok(Self { data, rows, dim })
    }

    /// Builds a matrix from a list of equally sized rows.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self> {
        if rows.is_empty() {
            return Err(RbcError::EmptyInput("points"));
        }
        let dim = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * dim);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != dim {
                return Err(RbcError::shape(
                    format!("row {} with {} dimensions", i, dim),
                    format!("{} dimensions", row.len()),
                ));
            }
            data.extend_from_slice(row);
        }
        Self::new(data, dim)
    }

    /// Number of points.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Dimensionality of every point.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// True when the matrix holds no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// The `i`-th point.
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Flat row-major storage.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Copies the listed rows, in order, into a new matrix.
    pub fn gather(&self, ids: &[usize]) -> PointMatrix {
        let mut data = Vec::with_capacity(ids.len() * self.dim);
        for &id in ids {
            data.extend_from_slice(self.row(id));
        }
        PointMatrix {
            data,
            rows: ids.len(),
            dim: self.dim,
        }
    }

    /// Splits the matrix into consecutive blocks of at most `max_rows` rows.
    pub fn row_blocks(&self, max_rows: usize) -> Vec<PointMatrix> {
        let max_rows = max_rows.max(1);
        self.data
            .chunks(max_rows * self.dim)
            .map(|chunk| PointMatrix {
                data: chunk.to_vec(),
                rows: chunk.len() / self.dim,
                dim: self.dim,
            })
            .collect()
    }

    /// Fails with `ShapeMismatch` unless `other` has the same dimensionality.
    pub fn check_same_dim(&self, other: &PointMatrix) -> Result<()> {
        if self.dim != other.dim {
            return Err(RbcError::shape(
                format!("dimension {}", self.dim),
                format!("dimension {}", other.dim),
            ));
        }
        Ok(())
    }
}

/// One ranked neighbor: squared distance and point index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Neighbor {
    /// Squared Euclidean distance to the query
    pub distance_sq: f32,
    /// Point index (original database row once finalized)
    pub index: u32,
}

impl Neighbor {
    /// Creates a neighbor entry.
    #[inline]
    pub fn new(distance_sq: f32, index: u32) -> Self {
        Self { distance_sq, index }
    }

    /// The placeholder for an unused top-k slot.
    #[inline]
    pub fn empty() -> Self {
        Self::new(EMPTY_DISTANCE, EMPTY_INDEX)
    }

    /// True for the unused-slot placeholder.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index == EMPTY_INDEX
    }

    /// Euclidean distance.
    #[inline]
    pub fn distance(&self) -> f32 {
        self.distance_sq.max(0.0).sqrt()
    }
}

/// Contiguous range of the reordered database owned by one representative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnedRange {
    /// First reordered position
    pub start: u32,
    /// Number of owned points
    pub len: u32,
}

impl OwnedRange {
    /// One past the last reordered position.
    #[inline]
    pub fn end(&self) -> u32 {
        self.start + self.len
    }
}

/// One scheduled comparison block: a query against a slice of one owned range.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WorkItem {
    /// Query row inside the batch
    pub query: u32,
    /// Representative whose owned range the slice comes from
    pub rep: u32,
    /// First reordered database position of the slice
    pub start: u32,
    /// Slice length
    pub len: u32,
    /// Output column (partial top-k slot) this item writes to
    pub out_col: u32,
    /// Padding to a 32-byte stride
    pub _padding: [u32; 3],
}

/// Uniform block of `compute_distances`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DistanceParams {
    /// Rows of A
    pub rows_a: u32,
    /// Rows of B handled by this pass
    pub rows_b: u32,
    /// Shared dimensionality
    pub dim: u32,
    /// First row of B handled by this pass
    pub b_offset: u32,
}

/// Uniform block of `find_ranges`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RangeParams {
    /// Rows of the distance matrix
    pub rows: u32,
    /// Columns of the distance matrix
    pub cols: u32,
    /// Weighted count every radius must reach
    pub target_count: u32,
    /// Bisection steps
    pub iterations: u32,
}

/// Uniform block of `assign_owners`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AssignParams {
    /// Representative rows of the distance block
    pub rows: u32,
    /// Database columns of the distance block
    pub cols: u32,
    /// Database position of column 0
    pub col_offset: u32,
    /// Padding for 16-byte alignment
    pub _padding: u32,
}

/// Uniform block of `plan_knn`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PlanParams {
    /// Number of work items
    pub num_items: u32,
    /// Shared dimensionality
    pub dim: u32,
    /// Neighbors kept per item
    pub k: u32,
    /// Padding for 16-byte alignment
    pub _padding: u32,
}

/// Configuration parameters for index construction and queries.
#[derive(Clone, Debug)]
pub struct RbcConfig {
    /// Width of a sorting-network block (power of two).
    pub merge_width: usize,
    /// Bisection steps taken by the range kernel.
    pub range_iterations: u32,
    /// Number of work items the plan builder aims for.
    pub target_work_items: usize,
    /// Smallest chunk the plan builder will cut.
    pub min_chunk: usize,
    /// Largest `k` accepted by the device executor.
    pub max_gpu_k: u32,
    /// Workgroup size of the range and assignment kernels.
    pub workgroup_size: u32,
    /// Maximum number of points that can be processed on the device.
    pub max_points: u32,
}

impl Default for RbcConfig {
    fn default() -> Self {
        Self {
            merge_width: 16,
            range_iterations: 24,
            target_work_items: 4096,
            min_chunk: 64,
            max_gpu_k: MAX_GPU_K,
            workgroup_size: 256,
            max_points: 10_000_000,
        }
    }
}

impl RbcConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.merge_width < 2 || !self.merge_width.is_power_of_two() {
            return Err("merge_width must be a power of 2 and at least 2".to_string());
        }
        if self.range_iterations == 0 {
            return Err("range_iterations must be greater than 0".to_string());
        }
        if self.target_work_items == 0 {
            return Err("target_work_items must be greater than 0".to_string());
        }
        if self.min_chunk == 0 {
            return Err("min_chunk must be greater than 0".to_string());
        }
        if self.max_gpu_k == 0 || self.max_gpu_k > MAX_GPU_K {
            return Err(format!("max_gpu_k must be in 1..={}", MAX_GPU_K));
        }
        // range.wgsl and assign.wgsl are compiled for 256 lanes
        if self.workgroup_size != 256 {
            return Err(format!(
                "workgroup_size ({}) must match the compiled kernels (256)",
                self.workgroup_size
            ));
        }
        Ok(())
    }

    /// Validated copy, as a crate error.
    pub(crate) fn checked(&self) -> Result<&Self> {
        self.validate().map_err(RbcError::InvalidConfig)?;
        Ok(self)
    }
}

/// Counters describing how a query batch was executed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryStats {
    /// Distance evaluations performed across all work items
    pub candidates_scored: u64,
    /// Work items in the computation plan
    pub work_items: usize,
    /// Chunk granularity chosen by the plan builder
    pub granularity: usize,
    /// Queries whose radius had to cover the whole database
    pub clipped_radii: usize,
}

/// Result of a kNN query batch.
#[derive(Clone, Debug)]
pub struct KnnResult {
    /// Requested neighbor count
    pub k: usize,
    /// Per query, up to `k` neighbors in ascending distance order.
    /// An empty list means no neighbor was found.
    pub neighbors: Vec<Vec<Neighbor>>,
    /// Execution counters
    pub stats: QueryStats,
    /// Optional timing information (in milliseconds)
    pub compute_time_ms: Option<f32>,
}

impl KnnResult {
    /// Neighbors of query `q`, or `CoverageGap` if its candidate set was empty.
    pub fn neighbors_of(&self, q: usize) -> Result<&[Neighbor]> {
        match self.neighbors.get(q) {
            Some(list) if !list.is_empty() => Ok(list),
            Some(_) => Err(RbcError::CoverageGap { query: q }),
            None => Err(RbcError::shape(
                format!("query index below {}", self.neighbors.len()),
                q,
            )),
        }
    }

    /// Queries that produced no neighbor.
    pub fn coverage_gaps(&self) -> Vec<usize> {
        self.neighbors
            .iter()
            .enumerate()
            .filter(|(_, list)| list.is_empty())
            .map(|(q, _)| q)
            .collect()
    }
}

/// Result of a single-nearest-neighbor query batch.
#[derive(Clone, Debug)]
pub struct NnResult {
    /// Per query, the nearest neighbor or `None` if no candidate existed
    pub nearest: Vec<Option<Neighbor>>,
    /// Execution counters
    pub stats: QueryStats,
    /// Optional timing information (in milliseconds)
    pub compute_time_ms: Option<f32>,
}

impl From<KnnResult> for NnResult {
    fn from(result: KnnResult) -> Self {
        Self {
            nearest: result
                .neighbors
                .into_iter()
                .map(|list| list.first().copied())
                .collect(),
            stats: result.stats,
            compute_time_ms: result.compute_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_shape_checks() {
        assert!(matches!(
            PointMatrix::new(vec![1.0, 2.0, 3.0], 2),
            Err(RbcError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            PointMatrix::new(vec![1.0], 0),
            Err(RbcError::EmptyInput(_))
        ));
        assert!(matches!(
            PointMatrix::new(vec![0.0, 0.0, f32::NAN, 1.0], 2),
            Err(RbcError::InvalidValues(1))
        ));
    }

    #[test]
    fn test_matrix_rows_and_gather() {
        let m = PointMatrix::from_rows(&[[0.0, 1.0], [2.0, 3.0], [4.0, 5.0]]).unwrap();
        assert_eq!(m.rows(), 3);
        assert_eq!(m.dim(), 2);
        assert_eq!(m.row(1), &[2.0, 3.0]);
        let g = m.gather(&[2, 0]);
        assert_eq!(g.as_slice(), &[4.0, 5.0, 0.0, 1.0]);
        let blocks = m.row_blocks(2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].rows(), 1);
    }

    #[test]
    fn test_empty_row_list_names_points() {
        let rows: Vec<[f32; 2]> = Vec::new();
        assert!(matches!(PointMatrix::from_rows(&rows), Err(RbcError::EmptyInput("points"))));
    }

    #[test]
    fn test_overflowing_norms_rejected() {
        assert!(matches!(
            PointMatrix::from_rows(&[[0.0], [1e20], [2e20]]),
            Err(RbcError::InvalidValues(1))
        ));
        // finite coordinates whose squared norm overflows
        assert!(matches!(
            PointMatrix::from_rows(&[[1.0, 1.0], [3e19, 3e19]]),
            Err(RbcError::InvalidValues(1))
        ));
        let large = PointMatrix::from_rows(&[[-3e18], [3e18]]).unwrap();
        let d = crate::distance::squared_distance(large.row(0), large.row(1));
        assert!(d.is_finite() && d < EMPTY_DISTANCE);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let rows: Vec<Vec<f32>> = vec![vec![0.0, 1.0], vec![2.0]];
        assert!(PointMatrix::from_rows(&rows).is_err());
    }

    #[test]
    fn test_gpu_struct_sizes() {
        assert_eq!(std::mem::size_of::<WorkItem>(), 32);
        assert_eq!(std::mem::size_of::<Neighbor>(), 8);
        assert_eq!(std::mem::size_of::<DistanceParams>(), 16);
        assert_eq!(std::mem::size_of::<PlanParams>(), 16);
    }

    #[test]
    fn test_config_validation() {
        let mut config = RbcConfig::default();
        assert!(config.validate().is_ok());

        config.merge_width = 12;
        assert!(config.validate().is_err());

        config.merge_width = 16;
        config.max_gpu_k = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_coverage_gap_accessor() {
        let result = KnnResult {
            k: 1,
            neighbors: vec![vec![Neighbor::new(0.5, 3)], vec![]],
            stats: QueryStats::default(),
            compute_time_ms: None,
        };
        assert_eq!(result.neighbors_of(0).unwrap()[0].index, 3);
        assert!(matches!(
            result.neighbors_of(1),
            Err(RbcError::CoverageGap { query: 1 })
        ));
        assert_eq!(result.coverage_gaps(), vec![1]);

        let nn = NnResult::from(result);
        assert!(nn.nearest[0].is_some());
        assert!(nn.nearest[1].is_none());
    }
}
