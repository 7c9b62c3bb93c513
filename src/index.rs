//! Random Ball Cover index.
//!
//! The index is built once: representatives are sampled from the database,
//! every point is assigned to its nearest representative, and the database
//! is stably partitioned by owner so each owned set is a contiguous range of
//! the reordered copy. Each representative also records a covering radius
//! over its owned set.
//!
//! Executors ([`crate::cpu`], [`crate::engine`]) produce the ownership table;
//! [`RbcIndex::assemble`] turns it into the immutable index.

use crate::{
    error::{RbcError, Result},
    range::find_range,
    types::{OwnedRange, PointMatrix, RbcConfig},
};
use log::{debug, warn};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;

/// Two-level nearest-neighbor index over a point set.
#[derive(Clone, Debug)]
pub struct RbcIndex {
    database: PointMatrix,
    representatives: PointMatrix,
    rep_ids: Vec<usize>,
    owners: Vec<u32>,
    owner_dists: Vec<f32>,
    owned: Vec<OwnedRange>,
    permutation: Vec<u32>,
    positions: Vec<u32>,
    radii: Vec<f32>,
}

/// Checks the structural preconditions of a build.
pub fn validate_build(database: &PointMatrix, rep_count: usize) -> Result<()> {
    if database.is_empty() {
        return Err(RbcError::EmptyInput("database"));
    }
    if rep_count == 0 {
        return Err(RbcError::EmptyInput("representatives"));
    }
    if rep_count > database.rows() {
        return Err(RbcError::InvalidRepresentativeCount {
            requested: rep_count,
            n: database.rows(),
        });
    }
    if database.rows() > u32::MAX as usize {
        return Err(RbcError::NotSupported(format!(
            "{} points exceeds the 32-bit index space",
            database.rows()
        )));
    }
    Ok(())
}

/// Samples `count` distinct database rows, uniformly and without replacement.
///
/// The ids are returned in ascending order, so a representative's position
/// in the list follows database order.
pub fn select_representatives(n: usize, count: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ids = rand::seq::index::sample(&mut rng, n, count).into_vec();
    ids.sort_unstable();
    ids
}

/// Validates caller-chosen representative ids.
pub fn validate_representatives(database: &PointMatrix, ids: &[usize]) -> Result<()> {
    validate_build(database, ids.len())?;
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    if let Some(&bad) = sorted.iter().find(|&&id| id >= database.rows()) {
        return Err(RbcError::shape(
            format!("representative ids below {}", database.rows()),
            bad,
        ));
    }
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(RbcError::shape("distinct representative ids", format!("{:?}", ids)));
    }
    Ok(())
}

/// Picks, for every column of a `reps x n` distance matrix, the row with the
/// smallest distance. Ties go to the lowest representative index.
pub fn assign_owners(dists: &[f32], reps: usize, n: usize) -> (Vec<u32>, Vec<f32>) {
    debug_assert_eq!(dists.len(), reps * n);
    (0..n)
        .into_par_iter()
        .map(|col| {
            let mut owner = 0u32;
            let mut best = dists[col];
            for r in 1..reps {
                let d = dists[r * n + col];
                if d < best {
                    best = d;
                    owner = r as u32;
                }
            }
            (owner, best)
        })
        .unzip()
}

impl RbcIndex {
    /// Builds the index from an ownership table.
    ///
    /// `owners[i]` is the representative (position in `rep_ids`) owning
    /// database row `i`, and `owner_dists[i]` the squared distance to it.
    ///
    /// # Errors
    /// `ShapeMismatch` if the table does not cover the database.
    pub fn assemble(
        database: &PointMatrix,
        rep_ids: Vec<usize>,
        owners: Vec<u32>,
        owner_dists: Vec<f32>,
        config: &RbcConfig,
    ) -> Result<Self> {
        let n = database.rows();
        let r = rep_ids.len();
        if owners.len() != n || owner_dists.len() != n {
            return Err(RbcError::shape(
                format!("ownership table for {} points", n),
                format!("{} owners, {} distances", owners.len(), owner_dists.len()),
            ));
        }
        if let Some(&bad) = owners.iter().find(|&&o| o as usize >= r) {
            return Err(RbcError::shape(format!("owner below {}", r), bad));
        }

        // Stable counting sort by owner
        let mut sizes = vec![0u32; r];
        for &o in &owners {
            sizes[o as usize] += 1;
        }
        let mut owned = Vec::with_capacity(r);
        let mut start = 0u32;
        for &len in &sizes {
            owned.push(OwnedRange { start, len });
            start += len;
        }
        let mut cursor: Vec<u32> = owned.iter().map(|o| o.start).collect();
        let mut permutation = vec![0u32; n];
        let mut positions = vec![0u32; n];
        for (id, &o) in owners.iter().enumerate() {
            let pos = cursor[o as usize];
            cursor[o as usize] += 1;
            permutation[pos as usize] = id as u32;
            positions[id] = pos;
        }

        let reordered: Vec<usize> = permutation.iter().map(|&id| id as usize).collect();
        let reordered_db = database.gather(&reordered);
        let representatives = database.gather(&rep_ids);

        // Covering radius of every owned set
        let radii: Vec<f32> = owned
            .par_iter()
            .map(|range| {
                let dists: Vec<f32> = (range.start..range.end())
                    .map(|pos| owner_dists[permutation[pos as usize] as usize])
                    .collect();
                find_range(&dists, None, range.len as u64, config.range_iterations).radius
            })
            .collect();

        let empty = sizes.iter().filter(|&&s| s == 0).count();
        if empty > 0 {
            warn!(
                "{} of {} representatives own no points (duplicate coordinates)",
                empty, r
            );
        }
        debug!(
            "Index assembled: {} points, {} representatives, largest owned set {}",
            n,
            r,
            sizes.iter().max().copied().unwrap_or(0)
        );

        Ok(Self {
            database: reordered_db,
            representatives,
            rep_ids,
            owners,
            owner_dists,
            owned,
            permutation,
            positions,
            radii,
        })
    }

    /// Number of indexed points.
    #[inline]
    pub fn len(&self) -> usize {
        self.database.rows()
    }

    /// True when the index holds no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.database.is_empty()
    }

    /// Dimensionality of the indexed points.
    #[inline]
    pub fn dim(&self) -> usize {
        self.database.dim()
    }

    /// Number of representatives.
    #[inline]
    pub fn num_representatives(&self) -> usize {
        self.rep_ids.len()
    }

    /// Representative coordinates, in representative order.
    pub fn representatives(&self) -> &PointMatrix {
        &self.representatives
    }

    /// Original database rows of the representatives.
    pub fn representative_ids(&self) -> &[usize] {
        &self.rep_ids
    }

    /// Representative owning original row `id`.
    #[inline]
    pub fn owner_of(&self, id: usize) -> u32 {
        self.owners[id]
    }

    /// Ownership table indexed by original row.
    pub fn owners(&self) -> &[u32] {
        &self.owners
    }

    /// Squared distance from original row `id` to its owner.
    #[inline]
    pub fn owner_distance(&self, id: usize) -> f32 {
        self.owner_dists[id]
    }

    /// Reordered range owned by representative `r`.
    #[inline]
    pub fn owned_range(&self, r: usize) -> OwnedRange {
        self.owned[r]
    }

    /// All owned ranges, in representative order.
    pub fn owned_ranges(&self) -> &[OwnedRange] {
        &self.owned
    }

    /// Owned-set sizes, used as range-kernel weights at query time.
    pub fn owned_sizes(&self) -> Vec<u32> {
        self.owned.iter().map(|o| o.len).collect()
    }

    /// Squared covering radius of every representative.
    pub fn radii(&self) -> &[f32] {
        &self.radii
    }

    /// Database copy in owner order.
    pub fn reordered_database(&self) -> &PointMatrix {
        &self.database
    }

    /// Original row stored at reordered position `pos`.
    #[inline]
    pub fn original_index(&self, pos: u32) -> u32 {
        self.permutation[pos as usize]
    }

    /// Reordered position of original row `id`.
    #[inline]
    pub fn reordered_position(&self, id: usize) -> u32 {
        self.positions[id]
    }

    /// Representatives whose owned set is empty.
    pub fn empty_representatives(&self) -> Vec<usize> {
        self.owned
            .iter()
            .enumerate()
            .filter(|(_, o)| o.len == 0)
            .map(|(r, _)| r)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::distance_matrix_alloc;

    fn build(database: &PointMatrix, rep_ids: Vec<usize>) -> RbcIndex {
        let reps = database.gather(&rep_ids);
        let dists = distance_matrix_alloc(&reps, database).unwrap();
        let (owners, owner_dists) = assign_owners(&dists, rep_ids.len(), database.rows());
        RbcIndex::assemble(database, rep_ids, owners, owner_dists, &RbcConfig::default()).unwrap()
    }

    fn square() -> PointMatrix {
        PointMatrix::from_rows(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0]]).unwrap()
    }

    #[test]
    fn test_partition_is_complete_and_contiguous() {
        let index = build(&square(), vec![0, 3]);
        assert_eq!(index.owned_range(0), OwnedRange { start: 0, len: 3 });
        assert_eq!(index.owned_range(1), OwnedRange { start: 3, len: 1 });

        let mut seen = vec![false; 4];
        for r in 0..index.num_representatives() {
            let range = index.owned_range(r);
            for pos in range.start..range.end() {
                let id = index.original_index(pos) as usize;
                assert!(!seen[id]);
                seen[id] = true;
                assert_eq!(index.owner_of(id) as usize, r);
                assert_eq!(index.reordered_position(id), pos);
                assert_eq!(index.reordered_database().row(pos as usize), square().row(id));
            }
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_ties_go_to_lowest_representative() {
        // point 1 sits exactly between representatives 0 and 2
        let db = PointMatrix::from_rows(&[[0.0], [1.0], [2.0]]).unwrap();
        let index = build(&db, vec![0, 2]);
        assert_eq!(index.owner_of(1), 0);
        assert_eq!(index.owned_sizes(), vec![2, 1]);
    }

    #[test]
    fn test_duplicate_representative_owns_nothing() {
        let db = PointMatrix::from_rows(&[[1.0], [1.0], [4.0]]).unwrap();
        let index = build(&db, vec![0, 1]);
        assert_eq!(index.empty_representatives(), vec![1]);
        assert_eq!(index.owned_range(0).len, 3);
    }

    #[test]
    fn test_radius_covers_owned_set() {
        let index = build(&square(), vec![0, 3]);
        for r in 0..index.num_representatives() {
            let range = index.owned_range(r);
            for pos in range.start..range.end() {
                let id = index.original_index(pos) as usize;
                assert!(index.owner_distance(id) <= index.radii()[r]);
            }
        }
        assert_eq!(index.radii()[1], 0.0);
    }

    #[test]
    fn test_validation() {
        let db = square();
        assert!(matches!(validate_build(&db, 0), Err(RbcError::EmptyInput(_))));
        assert!(matches!(
            validate_build(&db, 5),
            Err(RbcError::InvalidRepresentativeCount { requested: 5, n: 4 })
        ));
        assert!(validate_representatives(&db, &[0, 0]).is_err());
        assert!(validate_representatives(&db, &[4]).is_err());
        assert!(validate_representatives(&db, &[3, 1]).is_ok());
    }

    #[test]
    fn test_sampling_is_seeded_and_distinct() {
        let a = select_representatives(100, 10, 42);
        let b = select_representatives(100, 10, 42);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert!(a.iter().all(|&id| id < 100));
    }
}
