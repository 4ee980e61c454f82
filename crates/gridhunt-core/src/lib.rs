//! Core simulation for the gridhunt workspace.
//!
//! A deterministic pursuit/prey engine over a bounded 2D cell grid: agents
//! perceive hostiles by sight and by decaying sound events, propose one-cell
//! moves, and a two-phase resolver commits them so that no cell ever ends a
//! tick with more than one occupant. Each tick runs as a pipeline of staged
//! parallel passes with a barrier between stages; every stage reads the
//! previous stage's completed snapshot and writes a disjoint per-agent slot.
//! Randomness is seeded from the tick number and the agent's stable serial,
//! never from wall-clock state, so a seeded run replays exactly.

use gridhunt_index::{CellOccupancy, CellOccupantIndex, CellPresenceIndex, fold_cell_hash};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// The four compass directions, in the rotation order used by the random walk.
pub const COMPASS: [(i32, i32); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

/// The eight cells surrounding a cell (3x3 minus center).
pub const NEIGHBORHOOD_8: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Monotonic simulation tick counter.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// One discrete cell of the simulation plane.
///
/// The grid is conceptually a 3-tuple with the vertical axis fixed; only the
/// x and z components vary, and the folded hash treats y as zero.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct CellPos {
    pub x: i32,
    pub z: i32,
}

impl CellPos {
    /// Construct a new cell position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The cell offset by the given deltas.
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            z: self.z + dz,
        }
    }

    /// Chebyshev (ring) distance between two cells.
    #[must_use]
    pub fn chebyshev_distance(self, other: Self) -> u32 {
        (self.x - other.x)
            .unsigned_abs()
            .max((self.z - other.z).unsigned_abs())
    }

    /// Euclidean distance between cell centers.
    #[must_use]
    pub fn euclidean_distance(self, other: Self) -> f32 {
        let dx = (self.x - other.x) as f32;
        let dz = (self.z - other.z) as f32;
        (dx * dx + dz * dz).sqrt()
    }

    /// The cell's folded 32-bit hash (collision-tolerant).
    #[must_use]
    pub fn fold_hash(self) -> u32 {
        fold_cell_hash(self.x, self.z)
    }
}

/// Continuous world-space position, used only by the render boundary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct WorldPos {
    pub x: f32,
    pub z: f32,
}

impl WorldPos {
    /// Construct a new world position.
    #[must_use]
    pub const fn new(x: f32, z: f32) -> Self {
        Self { x, z }
    }

    /// Linear interpolation toward `target` by factor `alpha`.
    #[must_use]
    pub fn lerp(self, target: Self, alpha: f32) -> Self {
        Self {
            x: self.x + (target.x - self.x) * alpha,
            z: self.z + (target.z - self.z) * alpha,
        }
    }
}

/// One of the two opposing agent populations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Faction {
    Pursuer,
    Prey,
}

impl Faction {
    /// The opposing faction.
    #[must_use]
    pub const fn opponent(self) -> Self {
        match self {
            Self::Pursuer => Self::Prey,
            Self::Prey => Self::Pursuer,
        }
    }
}

/// Per-faction tuning: spawn stats and activation cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FactionParams {
    /// Health assigned to a freshly spawned agent of this faction.
    pub starting_health: f32,
    /// Flat damage each adjacent opposing agent receives per tick.
    pub attack_damage: f32,
    /// Ticks an agent of this faction waits between activations.
    pub turn_delay: u32,
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a gridhunt world.
///
/// Passed in whole at construction and treated as immutable by the pipeline;
/// the external configuration collaborator owns where the values come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridHuntConfig {
    /// Width of the grid in cells (x axis).
    pub world_width: u32,
    /// Depth of the grid in cells (z axis).
    pub world_depth: u32,
    /// Edge length of one cell in world units (render boundary only).
    pub cell_size: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Pursuer faction tuning.
    pub pursuer: FactionParams,
    /// Prey faction tuning.
    pub prey: FactionParams,
    /// Number of pursuers the seeding collaborator should place.
    pub pursuer_count: u32,
    /// Number of prey the seeding collaborator should place.
    pub prey_count: u32,
    /// Maximum Chebyshev radius of the sight ring scan.
    pub vision_distance: u32,
    /// Maximum Chebyshev radius of the hearing ring scan.
    pub hearing_distance: u32,
    /// Ticks an audible event survives before it is destroyed.
    pub audible_decay_ticks: u32,
    /// Per-tick interpolation factor for render positions, in (0, 1].
    pub render_lerp: f32,
    /// Wall-clock seconds per simulation tick (consumed by the runner).
    pub tick_seconds: f32,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Interval (ticks) between persistence flushes. 0 disables persistence.
    pub persistence_interval: u32,
}

impl Default for GridHuntConfig {
    fn default() -> Self {
        Self {
            world_width: 256,
            world_depth: 256,
            cell_size: 1.0,
            rng_seed: None,
            pursuer: FactionParams {
                starting_health: 100.0,
                attack_damage: 10.0,
                turn_delay: 2,
            },
            prey: FactionParams {
                starting_health: 100.0,
                attack_damage: 5.0,
                turn_delay: 1,
            },
            pursuer_count: 64,
            prey_count: 256,
            vision_distance: 12,
            hearing_distance: 20,
            audible_decay_ticks: 30,
            render_lerp: 0.35,
            tick_seconds: 0.05,
            history_capacity: 256,
            persistence_interval: 0,
        }
    }
}

impl GridHuntConfig {
    /// Validate configuration values, returning the first offending field.
    pub fn validate(&self) -> Result<(), WorldStateError> {
        if self.world_width == 0 || self.world_depth == 0 {
            return Err(WorldStateError::InvalidConfig(
                "world dimensions must be positive",
            ));
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(WorldStateError::InvalidConfig("cell_size must be positive"));
        }
        if self.vision_distance == 0 {
            return Err(WorldStateError::InvalidConfig(
                "vision_distance must be at least 1",
            ));
        }
        for params in [&self.pursuer, &self.prey] {
            if !(params.starting_health.is_finite() && params.starting_health > 0.0) {
                return Err(WorldStateError::InvalidConfig(
                    "starting_health must be positive and finite",
                ));
            }
            if !(params.attack_damage.is_finite() && params.attack_damage >= 0.0) {
                return Err(WorldStateError::InvalidConfig(
                    "attack_damage must be non-negative and finite",
                ));
            }
        }
        if !(self.render_lerp.is_finite() && self.render_lerp > 0.0 && self.render_lerp <= 1.0) {
            return Err(WorldStateError::InvalidConfig(
                "render_lerp must be in (0, 1]",
            ));
        }
        if !(self.tick_seconds.is_finite() && self.tick_seconds >= 0.0) {
            return Err(WorldStateError::InvalidConfig(
                "tick_seconds must be non-negative and finite",
            ));
        }
        Ok(())
    }

    /// Build the world RNG from the configured seed, or OS entropy if unset.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        }
    }

    /// Tuning parameters for the given faction.
    #[must_use]
    pub fn faction_params(&self, faction: Faction) -> FactionParams {
        match faction {
            Faction::Pursuer => self.pursuer,
            Faction::Prey => self.prey,
        }
    }

    /// Returns true when the cell lies inside the grid.
    #[must_use]
    pub fn in_bounds(&self, cell: CellPos) -> bool {
        cell.x >= 0
            && cell.z >= 0
            && (cell.x as u32) < self.world_width
            && (cell.z as u32) < self.world_depth
    }

    /// World-space center of a cell.
    #[must_use]
    pub fn cell_center(&self, cell: CellPos) -> WorldPos {
        WorldPos::new(
            (cell.x as f32 + 0.5) * self.cell_size,
            (cell.z as f32 + 0.5) * self.cell_size,
        )
    }
}

/// What an agent is doing this activation, for the render boundary and tests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MoveStance {
    #[default]
    Idle,
    /// Closing on a perceived target.
    Advancing,
    /// Adjacent to a target; holding the cell instead of moving.
    Attacking,
    /// Retreating from averaged visible threats.
    Fleeing,
    /// Random-walking with no perceived target.
    Wandering,
}

/// Most recent perception result for an agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PerceptionState {
    /// Sight-confirmed hostile cell, if any.
    pub sighted: Option<CellPos>,
    /// Target cell taken from an audible event, if sight found nothing.
    pub heard: Option<CellPos>,
}

/// Cold per-agent state kept outside the dense columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentRuntime {
    /// Outcome of the agent's last active perception pass.
    pub perception: PerceptionState,
    /// Behavior selected by the last active planning pass.
    pub stance: MoveStance,
}

/// A decaying, positioned record of a "heard a commotion over there" cue.
///
/// Created when a pursuer gains sight of prey; other pursuers that cannot see
/// the prey themselves pursue the event's `target`, not its origin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AudibleEvent {
    /// Cell of the observer that raised the alarm.
    pub origin: CellPos,
    /// Hostile position the observer saw.
    pub target: CellPos,
    /// Ticks since the event was emitted.
    pub age: u32,
}

/// Scalar fields for a single agent used when inserting or snapshotting from
/// the SoA store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub cell: CellPos,
    pub desired: CellPos,
    pub health: f32,
    pub max_health: f32,
    pub damage: f32,
    pub turns_until_active: u32,
    pub faction: Faction,
    /// Stable per-agent serial; feeds the deterministic random-walk stream.
    /// Always allocated by the world on insertion.
    pub serial: u64,
    pub render_position: WorldPos,
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    cells: Vec<CellPos>,
    desired: Vec<CellPos>,
    health: Vec<f32>,
    max_health: Vec<f32>,
    damage: Vec<f32>,
    turns: Vec<u32>,
    factions: Vec<Faction>,
    serials: Vec<u64>,
    render_positions: Vec<WorldPos>,
}

impl AgentColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: Vec::with_capacity(capacity),
            desired: Vec::with_capacity(capacity),
            health: Vec::with_capacity(capacity),
            max_health: Vec::with_capacity(capacity),
            damage: Vec::with_capacity(capacity),
            turns: Vec::with_capacity(capacity),
            factions: Vec::with_capacity(capacity),
            serials: Vec::with_capacity(capacity),
            render_positions: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve additional capacity in each backing vector.
    pub fn reserve(&mut self, additional: usize) {
        self.cells.reserve(additional);
        self.desired.reserve(additional);
        self.health.reserve(additional);
        self.max_health.reserve(additional);
        self.damage.reserve(additional);
        self.turns.reserve(additional);
        self.factions.reserve(additional);
        self.serials.reserve(additional);
        self.render_positions.reserve(additional);
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.desired.clear();
        self.health.clear();
        self.max_health.clear();
        self.damage.clear();
        self.turns.clear();
        self.factions.clear();
        self.serials.clear();
        self.render_positions.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData) {
        self.cells.push(agent.cell);
        self.desired.push(agent.desired);
        self.health.push(agent.health);
        self.max_health.push(agent.max_health);
        self.damage.push(agent.damage);
        self.turns.push(agent.turns_until_active);
        self.factions.push(agent.faction);
        self.serials.push(agent.serial);
        self.render_positions.push(agent.render_position);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> AgentData {
        let removed = AgentData {
            cell: self.cells.swap_remove(index),
            desired: self.desired.swap_remove(index),
            health: self.health.swap_remove(index),
            max_health: self.max_health.swap_remove(index),
            damage: self.damage.swap_remove(index),
            turns_until_active: self.turns.swap_remove(index),
            faction: self.factions.swap_remove(index),
            serial: self.serials.swap_remove(index),
            render_position: self.render_positions.swap_remove(index),
        };
        self.debug_assert_coherent();
        removed
    }

    /// Copy the row at `from` into position `to` without altering length.
    pub fn move_row(&mut self, from: usize, to: usize) {
        debug_assert!(from < self.len(), "move_row from out of bounds");
        debug_assert!(to < self.len(), "move_row to out of bounds");
        if from == to {
            return;
        }
        self.cells[to] = self.cells[from];
        self.desired[to] = self.desired[from];
        self.health[to] = self.health[from];
        self.max_health[to] = self.max_health[from];
        self.damage[to] = self.damage[from];
        self.turns[to] = self.turns[from];
        self.factions[to] = self.factions[from];
        self.serials[to] = self.serials[from];
        self.render_positions[to] = self.render_positions[from];
    }

    /// Truncate all columns to the provided length.
    pub fn truncate(&mut self, len: usize) {
        self.cells.truncate(len);
        self.desired.truncate(len);
        self.health.truncate(len);
        self.max_health.truncate(len);
        self.damage.truncate(len);
        self.turns.truncate(len);
        self.factions.truncate(len);
        self.serials.truncate(len);
        self.render_positions.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            cell: self.cells[index],
            desired: self.desired[index],
            health: self.health[index],
            max_health: self.max_health[index],
            damage: self.damage[index],
            turns_until_active: self.turns[index],
            faction: self.factions[index],
            serial: self.serials[index],
            render_position: self.render_positions[index],
        }
    }

    /// Immutable access to the grid cells.
    #[must_use]
    pub fn cells(&self) -> &[CellPos] {
        &self.cells
    }

    /// Mutable access to the grid cells.
    #[must_use]
    pub fn cells_mut(&mut self) -> &mut [CellPos] {
        &mut self.cells
    }

    /// Immutable access to the proposed next cells.
    #[must_use]
    pub fn desired(&self) -> &[CellPos] {
        &self.desired
    }

    /// Mutable access to the proposed next cells.
    #[must_use]
    pub fn desired_mut(&mut self) -> &mut [CellPos] {
        &mut self.desired
    }

    /// Immutable access to health values.
    #[must_use]
    pub fn health(&self) -> &[f32] {
        &self.health
    }

    /// Mutable access to health values.
    #[must_use]
    pub fn health_mut(&mut self) -> &mut [f32] {
        &mut self.health
    }

    /// Immutable access to maximum health values.
    #[must_use]
    pub fn max_health(&self) -> &[f32] {
        &self.max_health
    }

    /// Immutable access to per-tick attack damage values.
    #[must_use]
    pub fn damage(&self) -> &[f32] {
        &self.damage
    }

    /// Immutable access to activation countdowns.
    #[must_use]
    pub fn turns(&self) -> &[u32] {
        &self.turns
    }

    /// Mutable access to activation countdowns.
    #[must_use]
    pub fn turns_mut(&mut self) -> &mut [u32] {
        &mut self.turns
    }

    /// Immutable access to faction tags.
    #[must_use]
    pub fn factions(&self) -> &[Faction] {
        &self.factions
    }

    /// Immutable access to stable serials.
    #[must_use]
    pub fn serials(&self) -> &[u64] {
        &self.serials
    }

    /// Immutable access to interpolated render positions.
    #[must_use]
    pub fn render_positions(&self) -> &[WorldPos] {
        &self.render_positions
    }

    /// Mutable access to interpolated render positions.
    #[must_use]
    pub fn render_positions_mut(&mut self) -> &mut [WorldPos] {
        &mut self.render_positions
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.cells.len(), self.desired.len());
        debug_assert_eq!(self.cells.len(), self.health.len());
        debug_assert_eq!(self.cells.len(), self.max_health.len());
        debug_assert_eq!(self.cells.len(), self.damage.len());
        debug_assert_eq!(self.cells.len(), self.turns.len());
        debug_assert_eq!(self.cells.len(), self.factions.len());
        debug_assert_eq!(self.cells.len(), self.serials.len());
        debug_assert_eq!(self.cells.len(), self.render_positions.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl Default for AgentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: AgentColumns::new(),
        }
    }

    /// Create an arena with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: AgentColumns::with_capacity(capacity),
        }
    }

    /// Number of active agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no agents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over active agent handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: AgentId) -> Option<AgentData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Remove all agents whose ids are contained in `dead`, preserving
    /// iteration order of the survivors.
    pub fn remove_many(&mut self, dead: &HashSet<AgentId>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let mut write = 0;
        for read in 0..self.handles.len() {
            let id = self.handles[read];
            if dead.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.handles[write] = id;
                self.columns.move_row(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        let removed = self.handles.len().saturating_sub(write);
        self.handles.truncate(write);
        self.columns.truncate(write);
        removed
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored agents.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Obstacle cells supplied by the external map collaborator.
///
/// The presence index is cached across ticks and rebuilt only when the dirty
/// flag is raised, so a geometry change can never be silently missed nor a
/// stale index silently reused.
#[derive(Debug, Default)]
pub struct StaticGeometry {
    obstacles: Vec<CellPos>,
    presence: CellPresenceIndex,
    dirty: bool,
}

impl StaticGeometry {
    /// Create empty geometry with a pending first build.
    #[must_use]
    pub fn new() -> Self {
        Self {
            obstacles: Vec::new(),
            presence: CellPresenceIndex::new(),
            dirty: true,
        }
    }

    /// Replace the obstacle set and invalidate the cached index.
    pub fn set_obstacles(&mut self, obstacles: Vec<CellPos>) {
        self.obstacles = obstacles;
        self.dirty = true;
    }

    /// Signal that the external geometry changed in place.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns true while a rebuild is pending.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The current obstacle cells.
    #[must_use]
    pub fn obstacles(&self) -> &[CellPos] {
        &self.obstacles
    }

    /// The cached presence index. Valid only after `rebuild_if_dirty`.
    #[must_use]
    pub fn presence(&self) -> &CellPresenceIndex {
        &self.presence
    }

    /// Rebuild the cached presence index when the dirty flag is set.
    pub fn rebuild_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        let cells: Vec<(i32, i32)> = self.obstacles.iter().map(|c| (c.x, c.z)).collect();
        let rebuilt = self.presence.rebuild(&cells);
        debug_assert!(rebuilt.is_ok());
        self.dirty = false;
    }
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    pub deaths: usize,
    pub conversions: usize,
    pub moves_committed: usize,
    pub moves_frozen: usize,
    pub contested_cells: usize,
}

/// Summary emitted to persistence hooks each flush interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub pursuer_count: usize,
    pub prey_count: usize,
    pub deaths: usize,
    pub conversions: usize,
    pub moves_committed: usize,
    pub moves_frozen: usize,
    pub average_health: f32,
    pub audible_events: usize,
}

/// Scalar metric sampled during persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: Cow<'static, str>,
    pub value: f64,
}

impl MetricSample {
    /// Creates a new metric sample.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Helper for `f32` values.
    #[must_use]
    pub fn from_f32(name: &'static str, value: f32) -> Self {
        Self::new(name, f64::from(value))
    }
}

/// Event type recorded for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PersistenceEventKind {
    Deaths,
    Conversions,
    Custom(Cow<'static, str>),
}

/// Structured persistence event entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceEvent {
    pub kind: PersistenceEventKind,
    pub count: usize,
}

impl PersistenceEvent {
    /// Construct a new event entry.
    #[must_use]
    pub fn new(kind: PersistenceEventKind, count: usize) -> Self {
        Self { kind, count }
    }
}

/// Combined snapshot of dense columns and runtime metadata for a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub data: AgentData,
    pub runtime: AgentRuntime,
}

/// Aggregate payload forwarded to persistence sinks.
#[derive(Debug, Clone)]
pub struct PersistenceBatch {
    pub summary: TickSummary,
    pub metrics: Vec<MetricSample>,
    pub events: Vec<PersistenceEvent>,
    pub agents: Vec<AgentState>,
}

/// Persistence sink invoked on flush ticks.
pub trait WorldPersistence: Send {
    fn on_tick(&mut self, payload: &PersistenceBatch);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl WorldPersistence for NullPersistence {
    fn on_tick(&mut self, _payload: &PersistenceBatch) {}
}

/// Read-only per-agent render row, published once per tick after lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderAgent {
    pub id: AgentId,
    /// Interpolated world-space position.
    pub world_position: WorldPos,
    /// Faction tint scaled by the health fraction.
    pub color: [f32; 3],
    pub faction: Faction,
    pub stance: MoveStance,
    /// Visual-only "fade toward active" signal derived from the countdown.
    pub turn_fade: f32,
}

/// Per-agent perception scratch produced by the perceive stage.
#[derive(Debug, Clone, Copy, Default)]
struct PerceptionOutcome {
    sighted: Option<CellPos>,
    heard: Option<CellPos>,
    threat_average: Option<(f32, f32)>,
    alarm: Option<AudibleEvent>,
}

/// Per-agent planning scratch produced by the plan stage.
#[derive(Debug, Clone, Copy)]
struct PlanOutcome {
    desired: CellPos,
    stance: Option<MoveStance>,
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for an agent's per-tick random-walk stream.
///
/// Mixes the tick, the agent's current cell hash, and its stable serial so
/// the stream depends on nothing else. A fold that lands on zero is re-mixed
/// from tick and serial so no agent ever draws from the degenerate stream.
fn wander_seed(tick: u64, cell_hash: u32, serial: u64) -> u64 {
    let mut seed = u64::from(cell_hash)
        ^ tick.rotate_left(32)
        ^ serial.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    if seed == 0 {
        seed = tick.wrapping_add(serial) | 1;
    }
    splitmix64(seed)
}

/// Visit every cell of the square ring at Chebyshev distance `radius`.
fn for_each_ring_cell(center: CellPos, radius: i32, mut visit: impl FnMut(CellPos)) {
    debug_assert!(radius >= 1);
    for x in (center.x - radius)..=(center.x + radius) {
        visit(CellPos::new(x, center.z - radius));
        visit(CellPos::new(x, center.z + radius));
    }
    for z in (center.z - radius + 1)..=(center.z + radius - 1) {
        visit(CellPos::new(center.x - radius, z));
        visit(CellPos::new(center.x + radius, z));
    }
}

/// Walk the segment between two cell centers in unit steps and reject the
/// sight line if any intermediate cell holds a static obstacle.
fn line_of_sight_clear(from: CellPos, to: CellPos, statics: &CellPresenceIndex) -> bool {
    let dx = (to.x - from.x) as f32;
    let dz = (to.z - from.z) as f32;
    let distance = (dx * dx + dz * dz).sqrt();
    if distance <= 1.0 {
        return true;
    }
    let step_x = dx / distance;
    let step_z = dz / distance;
    let steps = distance.ceil() as i32;
    for k in 1..steps {
        let sample_x = (from.x as f32 + 0.5 + step_x * k as f32).floor() as i32;
        let sample_z = (from.z as f32 + 0.5 + step_z * k as f32).floor() as i32;
        if (sample_x == from.x && sample_z == from.z) || (sample_x == to.x && sample_z == to.z) {
            continue;
        }
        if statics.is_occupied(sample_x, sample_z) {
            return false;
        }
    }
    true
}

/// Expanding-ring sight search: the first ring with any line-of-sight hit
/// wins, ties within that ring broken by minimum Euclidean distance.
fn find_sight_target(
    origin: CellPos,
    hostiles: &CellOccupantIndex,
    statics: &CellPresenceIndex,
    vision: i32,
) -> Option<CellPos> {
    for radius in 1..=vision {
        let mut best: Option<(OrderedFloat<f32>, CellPos)> = None;
        for_each_ring_cell(origin, radius, |cell| {
            if hostiles.claimant_count(cell.x, cell.z) == 0 {
                return;
            }
            if !line_of_sight_clear(origin, cell, statics) {
                return;
            }
            let distance = OrderedFloat(origin.euclidean_distance(cell));
            match best {
                Some((current, _)) if current <= distance => {}
                _ => best = Some((distance, cell)),
            }
        });
        if let Some((_, cell)) = best {
            return Some(cell);
        }
    }
    None
}

/// Expanding-ring hearing search over audible event origins. No line-of-sight
/// check; sound carries around geometry. Returns the event's target cell.
fn find_heard_target(
    origin: CellPos,
    audible_index: &CellOccupantIndex,
    events: &[AudibleEvent],
    hearing: i32,
) -> Option<CellPos> {
    for radius in 1..=hearing {
        let mut best: Option<(OrderedFloat<f32>, CellPos)> = None;
        for_each_ring_cell(origin, radius, |cell| {
            if audible_index.claimant_count(cell.x, cell.z) == 0 {
                return;
            }
            let distance = OrderedFloat(origin.euclidean_distance(cell));
            match best {
                Some((current, _)) if current <= distance => {}
                _ => best = Some((distance, cell)),
            }
        });
        if let Some((_, cell)) = best {
            let event_idx = audible_index.occupants(cell.x, cell.z)[0] as usize;
            return Some(events[event_idx].target);
        }
    }
    None
}

/// Average the relative offsets of all visible hostiles within vision range,
/// accumulated incrementally: `avg = (avg*n + offset) / (n+1)`.
fn averaged_threat_offset(
    origin: CellPos,
    hostiles: &CellOccupantIndex,
    statics: &CellPresenceIndex,
    vision: i32,
) -> Option<(f32, f32)> {
    let mut average = (0.0f32, 0.0f32);
    let mut seen = 0.0f32;
    for radius in 1..=vision {
        for_each_ring_cell(origin, radius, |cell| {
            let count = hostiles.claimant_count(cell.x, cell.z);
            if count == 0 {
                return;
            }
            if !line_of_sight_clear(origin, cell, statics) {
                return;
            }
            let offset = ((cell.x - origin.x) as f32, (cell.z - origin.z) as f32);
            for _ in 0..count {
                average.0 = (average.0 * seen + offset.0) / (seen + 1.0);
                average.1 = (average.1 * seen + offset.1) / (seen + 1.0);
                seen += 1.0;
            }
        });
    }
    (seen > 0.0).then_some(average)
}

/// One greedy axis-dominant step toward `target`: the axis with the larger
/// delta magnitude is tried first, the other is the fallback.
fn greedy_step_toward(
    origin: CellPos,
    target: CellPos,
    blocked: &(impl Fn(CellPos) -> bool + Sync),
) -> Option<CellPos> {
    let dx = target.x - origin.x;
    let dz = target.z - origin.z;
    let along_x = (dx != 0).then(|| origin.offset(dx.signum(), 0));
    let along_z = (dz != 0).then(|| origin.offset(0, dz.signum()));
    let ordered = if dx.abs() >= dz.abs() {
        [along_x, along_z]
    } else {
        [along_z, along_x]
    };
    ordered.into_iter().flatten().find(|&cell| !blocked(cell))
}

/// One greedy axis-dominant step along a continuous direction vector.
fn greedy_step_along(
    origin: CellPos,
    direction: (f32, f32),
    blocked: &(impl Fn(CellPos) -> bool + Sync),
) -> Option<CellPos> {
    let (vx, vz) = direction;
    let sign = |v: f32| {
        if v > f32::EPSILON {
            1
        } else if v < -f32::EPSILON {
            -1
        } else {
            0
        }
    };
    let along_x = (sign(vx) != 0).then(|| origin.offset(sign(vx), 0));
    let along_z = (sign(vz) != 0).then(|| origin.offset(0, sign(vz)));
    let ordered = if vx.abs() >= vz.abs() {
        [along_x, along_z]
    } else {
        [along_z, along_x]
    };
    ordered.into_iter().flatten().find(|&cell| !blocked(cell))
}

/// Random-walk step: draw a starting direction from the tick-seeded stream
/// and try the four compass directions in rotation.
fn wander_step(
    origin: CellPos,
    tick: u64,
    serial: u64,
    blocked: &(impl Fn(CellPos) -> bool + Sync),
) -> Option<CellPos> {
    let mut rng = SmallRng::seed_from_u64(wander_seed(tick, origin.fold_hash(), serial));
    let draw = rng.random_range(0..COMPASS.len());
    for step in 0..COMPASS.len() {
        let (dx, dz) = COMPASS[(draw + step) % COMPASS.len()];
        let candidate = origin.offset(dx, dz);
        if !blocked(candidate) {
            return Some(candidate);
        }
    }
    None
}

fn health_color(faction: Faction, health: f32, max_health: f32) -> [f32; 3] {
    let fraction = if max_health > 0.0 {
        (health / max_health).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let tint = match faction {
        Faction::Pursuer => [0.86, 0.18, 0.12],
        Faction::Prey => [0.18, 0.78, 0.31],
    };
    tint.map(|channel| channel * (0.25 + 0.75 * fraction))
}

fn turn_fade(turns_until_active: u32, turn_delay: u32) -> f32 {
    if turn_delay == 0 {
        return 1.0;
    }
    (1.0 - turns_until_active as f32 / turn_delay as f32).clamp(0.0, 1.0)
}

/// The simulation world: agent storage, geometry, indices, and the tick
/// pipeline.
pub struct WorldState {
    config: GridHuntConfig,
    tick: Tick,
    rng: SmallRng,
    agents: AgentArena,
    runtime: AgentMap<AgentRuntime>,
    statics: StaticGeometry,
    audible: Vec<AudibleEvent>,
    dynamic_presence: CellPresenceIndex,
    pursuer_index: CellOccupantIndex,
    prey_index: CellOccupantIndex,
    audible_index: CellOccupantIndex,
    next_serial: u64,
    pending_deaths: Vec<AgentId>,
    pending_conversions: Vec<CellPos>,
    persistence: Box<dyn WorldPersistence>,
    last_deaths: usize,
    last_conversions: usize,
    last_committed: usize,
    last_frozen: usize,
    last_contested: usize,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("audible_events", &self.audible.len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: GridHuntConfig) -> Result<Self, WorldStateError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// Instantiate a new world using the supplied configuration and
    /// persistence sink.
    pub fn with_persistence(
        config: GridHuntConfig,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, WorldStateError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            agents: AgentArena::new(),
            runtime: AgentMap::new(),
            statics: StaticGeometry::new(),
            audible: Vec::new(),
            dynamic_presence: CellPresenceIndex::new(),
            pursuer_index: CellOccupantIndex::new(),
            prey_index: CellOccupantIndex::new(),
            audible_index: CellOccupantIndex::new(),
            next_serial: 0,
            pending_deaths: Vec::new(),
            pending_conversions: Vec::new(),
            persistence,
            last_deaths: 0,
            last_conversions: 0,
            last_committed: 0,
            last_frozen: 0,
            last_contested: 0,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Execute one simulation tick pipeline returning emitted events.
    pub fn step(&mut self) -> TickEvents {
        let next_tick = self.tick.next();

        self.statics.rebuild_if_dirty();
        self.stage_occupancy();
        self.stage_audible_index();
        let active = self.active_mask();
        let outcomes = self.stage_perceive(&active);
        self.stage_plan(next_tick, &active, &outcomes);
        self.stage_resolve();
        self.stage_damage();
        self.stage_lifecycle();
        self.stage_schedule();
        self.stage_audible_decay();
        self.stage_render_sync();

        let events = TickEvents {
            tick: next_tick,
            deaths: self.last_deaths,
            conversions: self.last_conversions,
            moves_committed: self.last_committed,
            moves_frozen: self.last_frozen,
            contested_cells: self.last_contested,
        };
        self.stage_persistence(next_tick);
        self.tick = next_tick;
        events
    }

    /// Which agents act this tick: countdown at zero means active.
    fn active_mask(&self) -> Vec<bool> {
        self.agents
            .columns()
            .turns()
            .iter()
            .map(|&turns| turns == 0)
            .collect()
    }

    /// Rebuild the dynamic collidable presence and the per-faction occupant
    /// indices from every agent's current cell. This is a synchronization
    /// point: planning reads a consistent snapshot of current occupancy,
    /// never proposed occupancy.
    fn stage_occupancy(&mut self) {
        let columns = self.agents.columns();
        let cell_pairs: Vec<(i32, i32)> = columns.cells().iter().map(|c| (c.x, c.z)).collect();
        let factions: Vec<Faction> = columns.factions().to_vec();

        let rebuilt = self.dynamic_presence.rebuild(&cell_pairs);
        debug_assert!(rebuilt.is_ok());
        let rebuilt = self
            .pursuer_index
            .rebuild_filtered(&cell_pairs, |idx| factions[idx] == Faction::Pursuer);
        debug_assert!(rebuilt.is_ok());
        let rebuilt = self
            .prey_index
            .rebuild_filtered(&cell_pairs, |idx| factions[idx] == Faction::Prey);
        debug_assert!(rebuilt.is_ok());
    }

    /// Index live audible events by their origin cell.
    fn stage_audible_index(&mut self) {
        let origins: Vec<(i32, i32)> = self
            .audible
            .iter()
            .map(|event| (event.origin.x, event.origin.z))
            .collect();
        let rebuilt = self.audible_index.rebuild(&origins);
        debug_assert!(rebuilt.is_ok());
    }

    /// Perception pass: sight rings, hearing fallback, evasion averaging.
    ///
    /// Pursuers search prey by sight first and audible events second;
    /// sight-confirmed detections raise a new alarm at the observer's cell.
    /// Prey average the offsets of every visible pursuer. Pure reads over
    /// this tick's indices; alarms are appended only after the parallel
    /// barrier, in dense agent order.
    fn stage_perceive(&mut self, active: &[bool]) -> Vec<PerceptionOutcome> {
        let len = self.agents.len();
        if len == 0 {
            return Vec::new();
        }

        let columns = self.agents.columns();
        let cells = columns.cells();
        let factions = columns.factions();
        let statics = self.statics.presence();
        let pursuers = &self.pursuer_index;
        let prey = &self.prey_index;
        let audible_index = &self.audible_index;
        let events = self.audible.as_slice();
        let vision = self.config.vision_distance as i32;
        let hearing = self.config.hearing_distance as i32;

        let outcomes: Vec<PerceptionOutcome> = (0..len)
            .into_par_iter()
            .map(|idx| {
                if !active[idx] {
                    return PerceptionOutcome::default();
                }
                let origin = cells[idx];
                match factions[idx] {
                    Faction::Pursuer => {
                        let sighted = find_sight_target(origin, prey, statics, vision);
                        let heard = if sighted.is_none() {
                            find_heard_target(origin, audible_index, events, hearing)
                        } else {
                            None
                        };
                        let alarm = sighted.map(|target| AudibleEvent {
                            origin,
                            target,
                            age: 0,
                        });
                        PerceptionOutcome {
                            sighted,
                            heard,
                            threat_average: None,
                            alarm,
                        }
                    }
                    Faction::Prey => PerceptionOutcome {
                        threat_average: averaged_threat_offset(origin, pursuers, statics, vision),
                        ..PerceptionOutcome::default()
                    },
                }
            })
            .collect();

        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        for (idx, outcome) in outcomes.iter().enumerate() {
            if !active[idx] {
                continue;
            }
            if let Some(runtime) = self.runtime.get_mut(handles[idx]) {
                runtime.perception.sighted = outcome.sighted;
                runtime.perception.heard = outcome.heard;
            }
            if let Some(alarm) = outcome.alarm {
                self.audible.push(alarm);
            }
        }
        outcomes
    }

    /// Planning pass: pursuit, evasion, or random walk, producing only the
    /// per-agent desired cell. Never writes to any occupancy index.
    fn stage_plan(&mut self, next_tick: Tick, active: &[bool], outcomes: &[PerceptionOutcome]) {
        let len = self.agents.len();
        if len == 0 {
            return;
        }

        let columns = self.agents.columns();
        let cells = columns.cells();
        let factions = columns.factions();
        let serials = columns.serials();
        let statics = self.statics.presence();
        let dynamics = &self.dynamic_presence;
        let config = &self.config;
        let blocked = |cell: CellPos| {
            !config.in_bounds(cell)
                || statics.is_occupied(cell.x, cell.z)
                || dynamics.is_occupied(cell.x, cell.z)
        };
        let tick_value = next_tick.0;

        let plans: Vec<PlanOutcome> = (0..len)
            .into_par_iter()
            .map(|idx| {
                let origin = cells[idx];
                if !active[idx] {
                    return PlanOutcome {
                        desired: origin,
                        stance: None,
                    };
                }
                match factions[idx] {
                    Faction::Pursuer => {
                        let target = outcomes[idx].sighted.or(outcomes[idx].heard);
                        if let Some(target) = target {
                            if origin.chebyshev_distance(target) <= 1 {
                                // Attack stance: hold the cell, suppress wandering.
                                PlanOutcome {
                                    desired: origin,
                                    stance: Some(MoveStance::Attacking),
                                }
                            } else {
                                let desired = greedy_step_toward(origin, target, &blocked)
                                    .unwrap_or(origin);
                                PlanOutcome {
                                    desired,
                                    stance: Some(MoveStance::Advancing),
                                }
                            }
                        } else {
                            let desired = wander_step(origin, tick_value, serials[idx], &blocked)
                                .unwrap_or(origin);
                            PlanOutcome {
                                desired,
                                stance: Some(MoveStance::Wandering),
                            }
                        }
                    }
                    Faction::Prey => {
                        if let Some((avg_x, avg_z)) = outcomes[idx].threat_average {
                            let desired =
                                greedy_step_along(origin, (-avg_x, -avg_z), &blocked)
                                    .unwrap_or(origin);
                            PlanOutcome {
                                desired,
                                stance: Some(MoveStance::Fleeing),
                            }
                        } else {
                            let desired = wander_step(origin, tick_value, serials[idx], &blocked)
                                .unwrap_or(origin);
                            PlanOutcome {
                                desired,
                                stance: Some(MoveStance::Wandering),
                            }
                        }
                    }
                }
            })
            .collect();

        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        {
            let desired = self.agents.columns_mut().desired_mut();
            for (idx, plan) in plans.iter().enumerate() {
                desired[idx] = plan.desired;
            }
        }
        for (idx, plan) in plans.iter().enumerate() {
            if let Some(stance) = plan.stance
                && let Some(runtime) = self.runtime.get_mut(handles[idx])
            {
                runtime.stance = stance;
            }
        }
    }

    /// Two-phase movement commit: classify every desired cell into a claims
    /// multi-map, then commit exactly the singleton claims. Contested cells
    /// freeze every contender. The outcome depends only on claim
    /// multiplicities, never on agent iteration order.
    fn stage_resolve(&mut self) {
        self.last_committed = 0;
        self.last_frozen = 0;
        self.last_contested = 0;
        let len = self.agents.len();
        if len == 0 {
            return;
        }

        let desired_snapshot: Vec<CellPos> = self.agents.columns().desired().to_vec();
        let claim_pairs: Vec<(i32, i32)> =
            desired_snapshot.iter().map(|c| (c.x, c.z)).collect();
        let mut claims = CellOccupantIndex::new();
        let rebuilt = claims.rebuild(&claim_pairs);
        debug_assert!(rebuilt.is_ok());

        let mut contested: HashSet<(i32, i32)> = HashSet::new();
        let cells = self.agents.columns_mut().cells_mut();
        for idx in 0..len {
            let desired = desired_snapshot[idx];
            if desired == cells[idx] {
                continue;
            }
            if claims.claimant_count(desired.x, desired.z) == 1 {
                cells[idx] = desired;
                self.last_committed += 1;
            } else {
                self.last_frozen += 1;
                contested.insert((desired.x, desired.z));
            }
        }
        self.last_contested = contested.len();
    }

    /// Aggregate adjacent-cell hostile damage per agent and apply it once.
    ///
    /// The per-faction indices are rebuilt from committed positions first,
    /// then every agent's total is computed in parallel from that snapshot
    /// and applied serially. Health is clamped at zero and non-finite values
    /// are guarded here, at the boundary.
    fn stage_damage(&mut self) {
        let len = self.agents.len();
        if len == 0 {
            return;
        }

        let columns = self.agents.columns();
        let cell_pairs: Vec<(i32, i32)> = columns.cells().iter().map(|c| (c.x, c.z)).collect();
        let factions: Vec<Faction> = columns.factions().to_vec();
        let damage_snapshot: Vec<f32> = columns.damage().to_vec();

        let rebuilt = self
            .pursuer_index
            .rebuild_filtered(&cell_pairs, |idx| factions[idx] == Faction::Pursuer);
        debug_assert!(rebuilt.is_ok());
        let rebuilt = self
            .prey_index
            .rebuild_filtered(&cell_pairs, |idx| factions[idx] == Faction::Prey);
        debug_assert!(rebuilt.is_ok());

        let pursuers = &self.pursuer_index;
        let prey = &self.prey_index;
        let totals: Vec<f32> = (0..len)
            .into_par_iter()
            .map(|idx| {
                let (x, z) = cell_pairs[idx];
                let opposing = match factions[idx] {
                    Faction::Pursuer => prey,
                    Faction::Prey => pursuers,
                };
                let mut total = 0.0f32;
                for &(dx, dz) in &NEIGHBORHOOD_8 {
                    for &occupant in opposing.occupants(x + dx, z + dz) {
                        total += damage_snapshot[occupant as usize];
                    }
                }
                total
            })
            .collect();

        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        let healths = self.agents.columns_mut().health_mut();
        for idx in 0..len {
            let mut next = healths[idx] - totals[idx];
            if !next.is_finite() {
                next = 0.0;
            }
            next = next.max(0.0);
            healths[idx] = next;
            if next <= 0.0 {
                self.pending_deaths.push(handles[idx]);
            }
        }
    }

    /// Remove this tick's dead and spawn faction-converted replacements.
    ///
    /// Deaths were detected from a single post-damage health snapshot. A dead
    /// prey agent vacates its cell to a brand-new pursuer (destroy-old /
    /// create-new, never an in-place mutation); a dead pursuer is simply
    /// removed. All removals precede all spawns.
    fn stage_lifecycle(&mut self) {
        self.last_deaths = 0;
        self.last_conversions = 0;
        if self.pending_deaths.is_empty() {
            return;
        }

        let drained: Vec<AgentId> = self.pending_deaths.drain(..).collect();
        let mut seen = HashSet::new();
        let mut dead: Vec<(usize, AgentId)> = Vec::new();
        for id in drained {
            if seen.insert(id)
                && let Some(idx) = self.agents.index_of(id)
            {
                dead.push((idx, id));
            }
        }
        if dead.is_empty() {
            return;
        }
        dead.sort_by_key(|&(idx, _)| idx);

        {
            let columns = self.agents.columns();
            for &(idx, _) in &dead {
                if columns.factions()[idx] == Faction::Prey {
                    self.pending_conversions.push(columns.cells()[idx]);
                }
            }
        }

        let dead_set: HashSet<AgentId> = dead.iter().map(|&(_, id)| id).collect();
        let removed = self.agents.remove_many(&dead_set);
        for &(_, id) in &dead {
            self.runtime.remove(id);
        }
        self.last_deaths = removed;

        let conversions = std::mem::take(&mut self.pending_conversions);
        self.last_conversions = conversions.len();
        for cell in conversions {
            self.spawn_converted(cell);
        }
    }

    /// Advance the activation countdowns: agents that acted this tick wrap
    /// back to their faction's delay, everyone else counts down by one.
    fn stage_schedule(&mut self) {
        let pursuer_delay = self.config.pursuer.turn_delay;
        let prey_delay = self.config.prey.turn_delay;
        let factions: Vec<Faction> = self.agents.columns().factions().to_vec();
        let turns = self.agents.columns_mut().turns_mut();
        for (idx, counter) in turns.iter_mut().enumerate() {
            if *counter == 0 {
                *counter = match factions[idx] {
                    Faction::Pursuer => pursuer_delay,
                    Faction::Prey => prey_delay,
                };
            } else {
                *counter -= 1;
            }
        }
    }

    /// Age audible events and destroy the expired ones.
    fn stage_audible_decay(&mut self) {
        for event in &mut self.audible {
            event.age += 1;
        }
        let decay = self.config.audible_decay_ticks;
        self.audible.retain(|event| event.age <= decay);
    }

    /// Move interpolated render positions toward the current cell centers.
    fn stage_render_sync(&mut self) {
        let alpha = self.config.render_lerp;
        let targets: Vec<WorldPos> = {
            let columns = self.agents.columns();
            columns
                .cells()
                .iter()
                .map(|&cell| self.config.cell_center(cell))
                .collect()
        };
        let render = self.agents.columns_mut().render_positions_mut();
        for (idx, position) in render.iter_mut().enumerate() {
            *position = position.lerp(targets[idx], alpha);
        }
    }

    fn stage_persistence(&mut self, next_tick: Tick) {
        if self.config.persistence_interval == 0
            || !next_tick
                .0
                .is_multiple_of(u64::from(self.config.persistence_interval))
        {
            self.reset_tick_counters();
            return;
        }

        let summary = self.build_summary(next_tick);
        let metrics = vec![
            MetricSample::from_f32("average_health", summary.average_health),
            MetricSample::new("pursuer_count", summary.pursuer_count as f64),
            MetricSample::new("prey_count", summary.prey_count as f64),
            MetricSample::new("moves_committed", summary.moves_committed as f64),
        ];

        let mut events = Vec::with_capacity(2);
        if self.last_deaths > 0 {
            events.push(PersistenceEvent::new(
                PersistenceEventKind::Deaths,
                self.last_deaths,
            ));
        }
        if self.last_conversions > 0 {
            events.push(PersistenceEvent::new(
                PersistenceEventKind::Conversions,
                self.last_conversions,
            ));
        }

        let mut agents = Vec::with_capacity(self.agents.len());
        for id in self.agents.iter_handles() {
            if let Some(snapshot) = self.snapshot_agent(id) {
                agents.push(snapshot);
            }
        }

        let batch = PersistenceBatch {
            summary: summary.clone(),
            metrics,
            events,
            agents,
        };
        self.persistence.on_tick(&batch);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.reset_tick_counters();
    }

    fn reset_tick_counters(&mut self) {
        self.last_deaths = 0;
        self.last_conversions = 0;
        self.last_committed = 0;
        self.last_frozen = 0;
        self.last_contested = 0;
    }

    fn build_summary(&self, tick: Tick) -> TickSummary {
        let agent_count = self.agents.len();
        let total_health: f32 = self.agents.columns().health().iter().sum();
        TickSummary {
            tick,
            pursuer_count: self.faction_count(Faction::Pursuer),
            prey_count: self.faction_count(Faction::Prey),
            deaths: self.last_deaths,
            conversions: self.last_conversions,
            moves_committed: self.last_committed,
            moves_frozen: self.last_frozen,
            average_health: if agent_count > 0 {
                total_health / agent_count as f32
            } else {
                0.0
            },
            audible_events: self.audible.len(),
        }
    }

    fn allocate_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Spawn the pursuer replacing a converted prey agent at its last cell.
    fn spawn_converted(&mut self, cell: CellPos) -> AgentId {
        let params = self.config.pursuer;
        let render_position = self.config.cell_center(cell);
        self.insert_agent(AgentData {
            cell,
            desired: cell,
            health: params.starting_health,
            max_health: params.starting_health,
            damage: params.attack_damage,
            turns_until_active: params.turn_delay,
            faction: Faction::Pursuer,
            serial: 0,
            render_position,
        })
    }

    /// Spawn a fresh agent of the given faction at a cell, using the
    /// faction's configured stats. Newly seeded agents act on their first
    /// tick.
    pub fn spawn_agent(&mut self, faction: Faction, cell: CellPos) -> AgentId {
        let params = self.config.faction_params(faction);
        let render_position = self.config.cell_center(cell);
        self.insert_agent(AgentData {
            cell,
            desired: cell,
            health: params.starting_health,
            max_health: params.starting_health,
            damage: params.attack_damage,
            turns_until_active: 0,
            faction,
            serial: 0,
            render_position,
        })
    }

    /// Insert an agent with explicit scalar data. The serial field is always
    /// replaced with a world-allocated one.
    pub fn insert_agent(&mut self, mut data: AgentData) -> AgentId {
        data.serial = self.allocate_serial();
        let id = self.agents.insert(data);
        self.runtime.insert(id, AgentRuntime::default());
        id
    }

    /// Remove an agent by handle, returning its last known data.
    pub fn remove_agent(&mut self, id: AgentId) -> Option<AgentData> {
        self.runtime.remove(id);
        self.agents.remove(id)
    }

    /// Replace the static obstacle set (invalidates the cached index).
    pub fn set_obstacles(&mut self, obstacles: Vec<CellPos>) {
        self.statics.set_obstacles(obstacles);
    }

    /// Signal that the external map geometry changed in place.
    pub fn mark_geometry_dirty(&mut self) {
        self.statics.mark_dirty();
    }

    /// The static obstacle cells.
    #[must_use]
    pub fn obstacles(&self) -> &[CellPos] {
        self.statics.obstacles()
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &GridHuntConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Borrow the world RNG mutably for deterministic seeding decisions.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Mutable access to the agent arena.
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut AgentArena {
        &mut self.agents
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Number of live agents in the given faction.
    #[must_use]
    pub fn faction_count(&self, faction: Faction) -> usize {
        self.agents
            .columns()
            .factions()
            .iter()
            .filter(|&&f| f == faction)
            .count()
    }

    /// Live audible events.
    #[must_use]
    pub fn audible_events(&self) -> &[AudibleEvent] {
        &self.audible
    }

    /// Borrow runtime data for a specific agent.
    #[must_use]
    pub fn agent_runtime(&self, id: AgentId) -> Option<&AgentRuntime> {
        self.runtime.get(id)
    }

    /// Mutably borrow runtime data for a specific agent.
    #[must_use]
    pub fn agent_runtime_mut(&mut self, id: AgentId) -> Option<&mut AgentRuntime> {
        self.runtime.get_mut(id)
    }

    /// Produce a combined snapshot for `id`.
    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentState> {
        let data = self.agents.snapshot(id)?;
        let runtime = self.runtime.get(id)?.clone();
        Some(AgentState { id, data, runtime })
    }

    /// Replace the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn WorldPersistence>) {
        self.persistence = persistence;
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Read-only render rows for every live agent, valid after the last
    /// completed tick. Only live agents appear; the external renderer infers
    /// removal by absence.
    #[must_use]
    pub fn render_view(&self) -> Vec<RenderAgent> {
        let columns = self.agents.columns();
        self.agents
            .iter_handles()
            .enumerate()
            .map(|(idx, id)| {
                let faction = columns.factions()[idx];
                let stance = self
                    .runtime
                    .get(id)
                    .map_or(MoveStance::Idle, |runtime| runtime.stance);
                RenderAgent {
                    id,
                    world_position: columns.render_positions()[idx],
                    color: health_color(faction, columns.health()[idx], columns.max_health()[idx]),
                    faction,
                    stance,
                    turn_fade: turn_fade(
                        columns.turns()[idx],
                        self.config.faction_params(faction).turn_delay,
                    ),
                }
            })
            .collect()
    }
}
