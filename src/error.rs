//! Error types for the rbc-knn-wgpu library.
//!
//! Structural errors (shapes, empty inputs, bad `k`) are raised before any
//! device or thread-pool work starts. Coverage gaps are per query and are
//! only surfaced through the per-query accessors on the result types.

use thiserror::Error;

/// Main error type for the rbc-knn-wgpu library.
#[derive(Error, Debug)]
pub enum RbcError {
    /// Dimension or size inconsistency between inputs.
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// What the operation expected
        expected: String,
        /// What it was given
        got: String,
    },

    /// Zero points, queries or representatives.
    #[error("Empty input: {0}")]
    EmptyInput(&'static str),

    /// `k` is zero or larger than the database.
    #[error("Invalid k: {k} (database holds {n} points)")]
    InvalidK {
        /// Requested neighbor count
        k: usize,
        /// Database size
        n: usize,
    },

    /// More representatives requested than there are database points.
    #[error("Invalid representative count: {requested} requested for {n} points")]
    InvalidRepresentativeCount {
        /// Requested representative count
        requested: usize,
        /// Database size
        n: usize,
    },

    /// A point holds NaN or infinity.
    #[error("Points contain invalid values at row {0}")]
    InvalidValues(usize),

    /// The configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A query ended up with an empty candidate set.
    #[error("No candidates found for query {query}")]
    CoverageGap {
        /// Query row inside the batch
        query: usize,
    },

    /// Error occurred during GPU device initialization or adapter selection.
    #[error("GPU initialization failed: {0}")]
    GpuInitError(String),

    /// Error occurred during shader compilation or pipeline creation.
    #[error("Shader compilation failed: {0}")]
    ShaderError(String),

    /// Error occurred during buffer creation or memory allocation.
    #[error("Buffer allocation failed: {0}")]
    BufferError(String),

    /// Error occurred during compute pass execution.
    #[error("Compute execution failed: {0}")]
    ComputeError(String),

    /// Error occurred during data transfer between CPU and GPU.
    #[error("Data transfer failed: {0}")]
    TransferError(String),

    /// The requested operation is not supported on the current hardware.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Generic wgpu error wrapper.
    #[error("wgpu error: {0}")]
    WgpuError(#[from] wgpu::Error),

    /// Error occurred during buffer mapping operations.
    #[error("Buffer mapping failed: {0}")]
    BufferMapError(#[from] wgpu::BufferAsyncError),
}

impl RbcError {
    /// Builds a [`RbcError::ShapeMismatch`] from anything printable.
    pub fn shape(expected: impl ToString, got: impl ToString) -> Self {
        RbcError::ShapeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// True for errors raised by input validation rather than by the device.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RbcError::ShapeMismatch { .. }
                | RbcError::EmptyInput(_)
                | RbcError::InvalidK { .. }
                | RbcError::InvalidRepresentativeCount { .. }
                | RbcError::InvalidValues(_)
                | RbcError::InvalidConfig(_)
        )
    }
}

/// Result type alias for operations that may fail with a RbcError.
pub type Result<T> = std::result::Result<T, RbcError>;
