//! Host distance kernel.
//!
//! Squared Euclidean distances are accumulated from coordinate differences,
//! never through the `|a|^2 + |b|^2 - 2ab` expansion, so results are never
//! negative and need no clamping before a square root.

use crate::{
    error::{RbcError, Result},
    types::PointMatrix,
};
use rayon::prelude::*;

/// Squared Euclidean distance between two equally sized slices.
#[inline]
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let d = x - y;
        acc += d * d;
    }
    acc
}

/// Writes the `a.rows() x b.rows()` matrix of squared distances into `out`.
///
/// Row `i` of `out` holds the distances from `a.row(i)` to every row of `b`.
///
/// # Errors
/// `ShapeMismatch` if the dimensionalities differ or `out` has the wrong length.
pub fn distance_matrix(a: &PointMatrix, b: &PointMatrix, out: &mut [f32]) -> Result<()> {
    a.check_same_dim(b)?;
    let cols = b.rows();
    if out.len() != a.rows() * cols {
        return Err(RbcError::shape(
            format!("{}x{} distance buffer", a.rows(), cols),
            format!("{} entries", out.len()),
        ));
    }
    if cols == 0 {
        return Ok(());
    }

    out.par_chunks_mut(cols).enumerate().for_each(|(i, row)| {
        let p = a.row(i);
        for (j, slot) in row.iter_mut().enumerate() {
            *slot = squared_distance(p, b.row(j));
        }
    });
    Ok(())
}

/// Allocating convenience wrapper around [`distance_matrix`].
pub fn distance_matrix_alloc(a: &PointMatrix, b: &PointMatrix) -> Result<Vec<f32>> {
    let mut out = vec![0.0; a.rows() * b.rows()];
    distance_matrix(a, b, &mut out)?;
    Ok(out)
}
