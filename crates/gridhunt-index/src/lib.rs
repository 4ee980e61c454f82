//! Spatial occupancy indices for grid-cell queries.
//!
//! Two lookup structures back the simulation's per-tick spatial queries:
//! [`CellPresenceIndex`] answers "is this cell blocked?" against a folded
//! 32-bit cell hash, and [`CellOccupantIndex`] answers "who stands here?"
//! against exact cell coordinates. Both rebuild through a sharded,
//! insert-only parallel pass and are read lock-free afterwards; a rebuild
//! is a synchronization point and callers must not query mid-build.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

/// Errors emitted by occupancy index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., zero shards).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

const PRIME_X: u32 = 73_856_093;
const PRIME_Z: u32 = 83_492_791;

/// Fold a grid cell into a 32-bit hash.
///
/// Classic three-prime XOR fold with the vertical term dropped: the
/// simulation plane is fixed at y = 0, so only the x and z products
/// contribute. Two distinct cells may alias to the same hash; presence
/// consumers treat an aliased hash as occupied, which is conservative
/// (false "blocked", never false "free").
#[must_use]
pub fn fold_cell_hash(x: i32, z: i32) -> u32 {
    (x as u32).wrapping_mul(PRIME_X) ^ (z as u32).wrapping_mul(PRIME_Z)
}

/// Common behaviour exposed by presence-style occupancy indices.
pub trait CellOccupancy {
    /// Rebuild internal structures from the given occupied cells.
    fn rebuild(&mut self, cells: &[(i32, i32)]) -> Result<(), IndexError>;

    /// Returns true when the cell (or any cell aliasing to its hash) is occupied.
    fn is_occupied(&self, x: i32, z: i32) -> bool;
}

/// Number of shards used during parallel index builds. Power of two so the
/// shard of a hash is a mask away.
const SHARD_COUNT: usize = 32;
const SHARD_MASK: u32 = (SHARD_COUNT as u32) - 1;

#[inline]
fn shard_of(hash: u32) -> usize {
    // Low bits of the fold are well mixed by the prime multiplications.
    (hash & SHARD_MASK) as usize
}

/// Presence index over folded cell hashes.
///
/// Backs the "is this cell collidable?" query for static geometry and for
/// the per-tick dynamic agent layer. Existence is all it stores; identity
/// consumers keep their own [`CellOccupantIndex`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellPresenceIndex {
    #[serde(skip)]
    shards: Vec<HashSet<u32>>,
}

impl CellPresenceIndex {
    /// Create an empty presence index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the raw hash is present.
    #[must_use]
    pub fn contains_hash(&self, hash: u32) -> bool {
        self.shards
            .get(shard_of(hash))
            .is_some_and(|shard| shard.contains(&hash))
    }

    /// Total number of distinct hashes stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(HashSet::len).sum()
    }

    /// Returns true when no cell is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(HashSet::is_empty)
    }
}

impl CellOccupancy for CellPresenceIndex {
    fn rebuild(&mut self, cells: &[(i32, i32)]) -> Result<(), IndexError> {
        let shards: Vec<Mutex<HashSet<u32>>> = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashSet::with_capacity(cells.len() / SHARD_COUNT + 1)))
            .collect();

        cells.par_iter().for_each(|&(x, z)| {
            let hash = fold_cell_hash(x, z);
            let mut shard = shards[shard_of(hash)]
                .lock()
                .expect("presence shard poisoned");
            shard.insert(hash);
        });

        self.shards = shards
            .into_iter()
            .map(|shard| shard.into_inner().expect("presence shard poisoned"))
            .collect();
        Ok(())
    }

    fn is_occupied(&self, x: i32, z: i32) -> bool {
        self.contains_hash(fold_cell_hash(x, z))
    }
}

/// Identity-bearing occupancy index: exact cell coordinates mapped to the
/// dense indices of their occupants.
///
/// Used wherever the simulation needs to know *who* stands on a cell
/// (perception targets, adjacent-cell damage, movement claims). Keys are
/// exact coordinates rather than folded hashes so identity queries never
/// see aliased occupants; the shard a cell lands in is still picked by the
/// fold, which only routes, never aliases contents.
#[derive(Debug, Clone, Default)]
pub struct CellOccupantIndex {
    shards: Vec<HashMap<(i32, i32), Vec<u32>>>,
}

impl CellOccupantIndex {
    /// Create an empty occupant index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a dense slice of occupant cells; the occupant recorded
    /// for `cells[i]` is `i`.
    pub fn rebuild(&mut self, cells: &[(i32, i32)]) -> Result<(), IndexError> {
        self.rebuild_filtered(cells, |_| true)
    }

    /// Rebuild from a dense slice, keeping only occupants accepted by
    /// `keep`. Dense indices are preserved (they index the original slice).
    pub fn rebuild_filtered(
        &mut self,
        cells: &[(i32, i32)],
        keep: impl Fn(usize) -> bool + Sync,
    ) -> Result<(), IndexError> {
        let shards: Vec<Mutex<HashMap<(i32, i32), Vec<u32>>>> = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::with_capacity(cells.len() / SHARD_COUNT + 1)))
            .collect();

        cells.par_iter().enumerate().for_each(|(idx, &(x, z))| {
            if !keep(idx) {
                return;
            }
            let hash = fold_cell_hash(x, z);
            let mut shard = shards[shard_of(hash)]
                .lock()
                .expect("occupant shard poisoned");
            shard.entry((x, z)).or_default().push(idx as u32);
        });

        let mut built: Vec<HashMap<(i32, i32), Vec<u32>>> = shards
            .into_iter()
            .map(|shard| shard.into_inner().expect("occupant shard poisoned"))
            .collect();
        // Insertion order inside a bucket depends on rayon scheduling; sort
        // so downstream iteration is deterministic.
        for shard in &mut built {
            for occupants in shard.values_mut() {
                occupants.sort_unstable();
            }
        }
        self.shards = built;
        Ok(())
    }

    /// Dense occupant indices registered at the exact cell.
    #[must_use]
    pub fn occupants(&self, x: i32, z: i32) -> &[u32] {
        let hash = fold_cell_hash(x, z);
        self.shards
            .get(shard_of(hash))
            .and_then(|shard| shard.get(&(x, z)))
            .map_or(&[], Vec::as_slice)
    }

    /// Number of occupants claiming the exact cell.
    #[must_use]
    pub fn claimant_count(&self, x: i32, z: i32) -> usize {
        self.occupants(x, z).len()
    }

    /// Total number of registered occupants across all cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Returns true when no occupant is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_deterministic_and_plane_fixed() {
        assert_eq!(fold_cell_hash(3, -7), fold_cell_hash(3, -7));
        assert_ne!(fold_cell_hash(3, -7), fold_cell_hash(-7, 3));
        assert_eq!(fold_cell_hash(0, 0), 0);
    }

    #[test]
    fn presence_reports_inserted_cells() {
        let mut index = CellPresenceIndex::new();
        index
            .rebuild(&[(0, 0), (5, 9), (-3, 120), (5, 9)])
            .expect("rebuild");
        assert!(index.is_occupied(5, 9));
        assert!(index.is_occupied(-3, 120));
        assert!(!index.is_occupied(6, 9));
        assert_eq!(index.len(), 3, "duplicate cell folds to one hash");
    }

    #[test]
    fn presence_rebuild_replaces_previous_contents() {
        let mut index = CellPresenceIndex::new();
        index.rebuild(&[(1, 1)]).expect("rebuild");
        assert!(index.is_occupied(1, 1));
        index.rebuild(&[(2, 2)]).expect("rebuild");
        assert!(!index.is_occupied(1, 1));
        assert!(index.is_occupied(2, 2));
    }

    #[test]
    fn aliased_hash_reads_as_occupied() {
        // The z prime is odd, hence invertible mod 2^32; construct a second
        // cell that folds to the first cell's hash exactly.
        let mut inv: u32 = 1;
        for _ in 0..5 {
            inv = inv.wrapping_mul(2u32.wrapping_sub(PRIME_Z.wrapping_mul(inv)));
        }
        assert_eq!(PRIME_Z.wrapping_mul(inv), 1);

        let (x1, z1) = (12, 34);
        let x2 = 999;
        let target = fold_cell_hash(x1, z1) ^ (x2 as u32).wrapping_mul(PRIME_X);
        let z2 = inv.wrapping_mul(target) as i32;
        assert_ne!((x1, z1), (x2, z2));
        assert_eq!(fold_cell_hash(x1, z1), fold_cell_hash(x2, z2));

        let mut index = CellPresenceIndex::new();
        index.rebuild(&[(x1, z1)]).expect("rebuild");
        assert!(
            index.is_occupied(x2, z2),
            "aliased cell must read as occupied (conservative)"
        );
    }

    #[test]
    fn serialized_presence_index_requires_rebuild() {
        let mut index = CellPresenceIndex::new();
        index.rebuild(&[(3, 4)]).expect("rebuild");
        let json = serde_json::to_string(&index).expect("serialize");
        let restored: CellPresenceIndex = serde_json::from_str(&json).expect("deserialize");
        assert!(
            restored.is_empty(),
            "shard contents are transient; the owner rebuilds after load"
        );
    }

    #[test]
    fn occupants_are_exact_and_sorted() {
        let mut index = CellOccupantIndex::new();
        let cells = [(4, 4), (9, 1), (4, 4), (4, 5), (4, 4)];
        index.rebuild(&cells).expect("rebuild");
        assert_eq!(index.occupants(4, 4), &[0, 2, 4]);
        assert_eq!(index.occupants(9, 1), &[1]);
        assert_eq!(index.claimant_count(4, 5), 1);
        assert_eq!(index.claimant_count(0, 0), 0);
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn occupant_filter_preserves_dense_indices() {
        let mut index = CellOccupantIndex::new();
        let cells = [(1, 1), (2, 2), (1, 1), (3, 3)];
        index
            .rebuild_filtered(&cells, |idx| idx != 0)
            .expect("rebuild");
        assert_eq!(index.occupants(1, 1), &[2]);
        assert_eq!(index.occupants(2, 2), &[1]);
        assert_eq!(index.occupants(3, 3), &[3]);
    }

    #[test]
    fn large_parallel_rebuild_matches_serial_expectation() {
        let cells: Vec<(i32, i32)> = (0..10_000).map(|i| (i % 97, i / 97)).collect();
        let mut index = CellOccupantIndex::new();
        index.rebuild(&cells).expect("rebuild");
        assert_eq!(index.len(), cells.len());
        for (idx, &(x, z)) in cells.iter().enumerate() {
            assert!(index.occupants(x, z).contains(&(idx as u32)));
        }
    }
}
