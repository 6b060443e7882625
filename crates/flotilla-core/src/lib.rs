//! Turn engine for an automated fleet on a toroidal grid.
//!
//! Each game turn the engine receives a snapshot of the world (cell
//! resources, every ship, every structure) and emits one command per owned
//! ship plus an optional spawn request. Routing is a bounded-window
//! weighted shortest path; collision avoidance is an ephemeral per-turn
//! claim ledger; behaviour is a four-state task classifier feeding a
//! greedy target matcher. Everything runs single-threaded inside one
//! `plan_turn` call, and a soft wall-clock budget truncates late stages
//! rather than erroring out.

use flotilla_index::ResourcePyramid;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Per-turn handle for an owned ship.
    pub struct ShipKey;
}

/// Convenience alias for associating side data with ships.
pub type ShipMap<T> = SecondaryMap<ShipKey, T>;

/// Stable ship identifier assigned by the host simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShipId(pub u32);

/// Player identifier assigned by the host simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

/// Cost of moving off a cell, charged against the moving ship's cargo.
///
/// The host simulation charges exactly `floor(0.1 * resource)`; the path
/// planner and the affordability filter both rely on reproducing it.
#[must_use]
pub const fn move_cost(cell_resource: u32) -> u32 {
    cell_resource / 10
}

/// A single-step move. The only legal motions are the four cardinal
/// directions and staying put; there is no diagonal movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    South,
    East,
    West,
    Still,
}

impl Direction {
    /// The four cardinal directions in fixed enumeration order. Tie-breaks
    /// throughout the engine follow this order.
    pub const CARDINALS: [Self; 4] = [Self::North, Self::South, Self::East, Self::West];

    /// Coordinate offset of one step. North decreases `y`.
    #[must_use]
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Self::North => (0, -1),
            Self::South => (0, 1),
            Self::East => (1, 0),
            Self::West => (-1, 0),
            Self::Still => (0, 0),
        }
    }
}

/// A cell coordinate. Positions are reduced modulo the grid dimensions by
/// [`Grid::normalize`]; the engine only ever stores reduced positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// What a structure is for: the home base accepts deposits and spawns,
/// a dropoff only accepts deposits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureKind {
    Shipyard,
    Dropoff,
}

/// An immobile installation. Read-only for the duration of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub owner: PlayerId,
    pub position: Position,
    pub kind: StructureKind,
}

/// A ship seen in the snapshot, friendly or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipObservation {
    pub id: ShipId,
    pub owner: PlayerId,
    pub position: Position,
    pub cargo: u32,
}

/// The ship currently sitting on a cell. `key` is populated only for
/// owned ships; foreign ships are tracked by owner and cargo alone.
#[derive(Debug, Clone, Copy)]
pub struct Occupant {
    pub owner: PlayerId,
    pub cargo: u32,
    pub key: Option<ShipKey>,
}

/// One cell of the grid.
///
/// At most one occupant and at most one claim may exist per cell at any
/// instant within a turn; the sequential processing order in
/// [`Engine::plan_turn`] is what upholds this, not any locking.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cell {
    pub resource: u32,
    pub occupant: Option<Occupant>,
    pub structure: Option<Structure>,
    pub claim: Option<ShipKey>,
}

impl Cell {
    #[must_use]
    pub const fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }

    #[must_use]
    pub const fn is_claimed(&self) -> bool {
        self.claim.is_some()
    }

    #[must_use]
    pub const fn has_structure(&self) -> bool {
        self.structure.is_some()
    }
}

/// An owned ship during turn processing.
#[derive(Debug, Clone, Copy)]
pub struct Ship {
    pub id: ShipId,
    pub owner: PlayerId,
    pub position: Position,
    pub cargo: u32,
    /// Task carried over from the previous turn until the classifier
    /// reassigns it. `None` is treated as gathering by the orchestrator.
    pub task: Option<Task>,
}

/// Errors emitted by the engine. Expected degraded outcomes (unreachable
/// target, no safe move, budget overrun) are not errors; these cover
/// contract violations only.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Indicates a configuration value the engine cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Indicates snapshot data that violates the input contract.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(&'static str),
}

/// The toroidal grid for one turn.
#[derive(Debug, Clone)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
    total_resource: u64,
    max_resource: u32,
}

impl Grid {
    /// Build a grid from row-major per-cell resource quantities.
    pub fn new(width: u32, height: u32, resources: &[u32]) -> Result<Self, EngineError> {
        if width == 0 || height == 0 {
            return Err(EngineError::MalformedSnapshot(
                "grid dimensions must be non-zero",
            ));
        }
        let expected = (width as usize) * (height as usize);
        if resources.len() != expected {
            return Err(EngineError::MalformedSnapshot(
                "resource grid length must equal width * height",
            ));
        }
        let mut total = 0u64;
        let mut max = 0u32;
        let cells = resources
            .iter()
            .map(|&resource| {
                total += u64::from(resource);
                max = max.max(resource);
                Cell {
                    resource,
                    ..Cell::default()
                }
            })
            .collect();
        Ok(Self {
            width,
            height,
            cells,
            total_resource: total,
            max_resource: max,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn total_resource(&self) -> u64 {
        self.total_resource
    }

    #[must_use]
    pub const fn max_resource(&self) -> u32 {
        self.max_resource
    }

    /// Mean cell richness, rounded down.
    #[must_use]
    pub const fn average_resource(&self) -> u64 {
        self.total_resource / (self.width as u64 * self.height as u64)
    }

    /// Reduce a position into the grid, wrapping both axes.
    #[must_use]
    pub fn normalize(&self, position: Position) -> Position {
        Position::new(
            position.x.rem_euclid(self.width as i32),
            position.y.rem_euclid(self.height as i32),
        )
    }

    /// Wrap-around Manhattan distance: per axis, the shorter of the direct
    /// span and the span across the seam.
    #[must_use]
    pub fn distance(&self, a: Position, b: Position) -> u32 {
        let a = self.normalize(a);
        let b = self.normalize(b);
        let dx = a.x.abs_diff(b.x);
        let dy = a.y.abs_diff(b.y);
        dx.min(self.width - dx) + dy.min(self.height - dy)
    }

    /// The position one step away in `direction`, wrapped.
    #[must_use]
    pub fn step(&self, position: Position, direction: Direction) -> Position {
        let (dx, dy) = direction.offset();
        self.normalize(Position::new(position.x + dx, position.y + dy))
    }

    fn index(&self, position: Position) -> usize {
        let p = self.normalize(position);
        p.y as usize * self.width as usize + p.x as usize
    }

    #[must_use]
    pub fn cell(&self, position: Position) -> &Cell {
        &self.cells[self.index(position)]
    }

    pub fn cell_mut(&mut self, position: Position) -> &mut Cell {
        let idx = self.index(position);
        &mut self.cells[idx]
    }

    /// Clear every cell's claim. Run once at the start of each turn.
    pub fn reset_claims(&mut self) {
        for cell in &mut self.cells {
            cell.claim = None;
        }
    }

    /// Record a ship's intended destination in the claim ledger and return
    /// the destination cell.
    ///
    /// A self-destructing ship stepping onto a structure leaves no claim:
    /// piling several ships onto the same structure is legal there.
    /// Conflicts are not detected here; the orchestrator prevents them by
    /// checking claim state before any move is finalized.
    pub fn register_move(
        &mut self,
        ship: ShipKey,
        from: Position,
        direction: Direction,
        crash_on_structure: bool,
    ) -> Position {
        let destination = self.step(from, direction);
        if !(crash_on_structure && self.cell(destination).has_structure()) {
            self.cell_mut(destination).claim = Some(ship);
        }
        destination
    }

    /// Collision-avoidance fallback for when a planned step is unsafe.
    ///
    /// Candidates are staying put (only while the current cell is
    /// unclaimed) and the four cardinal steps whose destination is
    /// unclaimed and either empty or holding a friendly ship. The
    /// candidate closest to `target` wins; ties keep the first candidate
    /// in enumeration order. Returns `None` when nothing survives; the
    /// ship accepts logical immobility, and any stale claim on its own
    /// cell is released rather than risking double occupancy.
    pub fn safe_greedy_move(
        &mut self,
        source: Position,
        target: Position,
        me: PlayerId,
    ) -> Option<Direction> {
        let mut candidates: Vec<Direction> = Vec::with_capacity(5);
        if !self.cell(source).is_claimed() {
            candidates.push(Direction::Still);
        }
        for direction in Direction::CARDINALS {
            let destination = self.step(source, direction);
            let cell = self.cell(destination);
            if cell.is_claimed() {
                continue;
            }
            match cell.occupant {
                None => candidates.push(direction),
                Some(occupant) if occupant.owner == me => candidates.push(direction),
                Some(_) => {}
            }
        }

        if candidates.is_empty() {
            self.cell_mut(source).claim = None;
            return None;
        }

        let mut best = (candidates[0], u32::MAX);
        for direction in candidates {
            let span = self.distance(self.step(source, direction), target);
            if span < best.1 {
                best = (direction, span);
            }
        }
        Some(best.0)
    }
}

/// What the path planner optimises for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostMode {
    /// Minimise movement cost: edge weight is the cell's resource.
    Cheapest,
    /// Travel through rich terrain: edge weight is
    /// `max(1, capacity - resource)`, saturating so replenished cells
    /// richer than nominal capacity cannot go negative.
    Costliest,
}

/// Tentative distance of a window cell. `Unreachable` is a distinct
/// marker, never a large sentinel weight, so blocked cells cannot collide
/// with legitimately expensive paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PathDistance {
    Finite(u64),
    Unreachable,
}

/// Rectangular search window covering source and target plus margin,
/// following the wrapped span along an axis whenever it is shorter.
struct SearchWindow {
    origin: Position,
    len_x: u32,
    len_y: u32,
}

impl SearchWindow {
    fn covering(grid: &Grid, source: Position, target: Position, margin: u32) -> Self {
        let (ox, len_x) = Self::axis(source.x, target.x, grid.width(), margin);
        let (oy, len_y) = Self::axis(source.y, target.y, grid.height(), margin);
        Self {
            origin: Position::new(ox, oy),
            len_x,
            len_y,
        }
    }

    fn axis(a: i32, b: i32, extent: u32, margin: u32) -> (i32, u32) {
        let lo = a.min(b);
        let hi = a.max(b);
        let direct = (hi - lo) as u32;
        let wrapped = extent - direct;
        let (start, span) = if direct <= wrapped {
            (lo, direct)
        } else {
            (hi, wrapped)
        };
        let len = (span + 2 * margin + 1).min(extent);
        (start - margin as i32, len)
    }

    fn area(&self) -> usize {
        self.len_x as usize * self.len_y as usize
    }

    fn offset_of(&self, grid: &Grid, position: Position) -> Option<usize> {
        let dx = (position.x - self.origin.x).rem_euclid(grid.width() as i32) as u32;
        let dy = (position.y - self.origin.y).rem_euclid(grid.height() as i32) as u32;
        (dx < self.len_x && dy < self.len_y).then(|| (dy * self.len_x + dx) as usize)
    }

    fn position_at(&self, grid: &Grid, offset: usize) -> Position {
        let dx = (offset as u32) % self.len_x;
        let dy = (offset as u32) / self.len_x;
        grid.normalize(Position::new(
            self.origin.x + dx as i32,
            self.origin.y + dy as i32,
        ))
    }
}

/// Cost-weighted single-step router.
///
/// Runs Dijkstra inside a bounded window around source and target and
/// returns only the first step of the locally cheapest path. Unreachable
/// targets resolve to [`Direction::Still`], never an error.
pub struct PathPlanner<'g> {
    grid: &'g Grid,
    me: PlayerId,
    capacity: u32,
    mode: CostMode,
    margin: u32,
    through_enemies: bool,
}

impl<'g> PathPlanner<'g> {
    #[must_use]
    pub fn new(grid: &'g Grid, me: PlayerId, capacity: u32) -> Self {
        Self {
            grid,
            me,
            capacity,
            mode: CostMode::Cheapest,
            margin: 1,
            through_enemies: false,
        }
    }

    /// Extra window padding: each unit allows a detour around one more
    /// unexpected blocker.
    #[must_use]
    pub fn margin(mut self, margin: u32) -> Self {
        self.margin = margin;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: CostMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stop treating foreign-occupied cells as walls. Hunters need this:
    /// their targets are, by definition, foreign-occupied.
    #[must_use]
    pub fn through_enemies(mut self) -> Self {
        self.through_enemies = true;
        self
    }

    /// Weight for stepping onto `position`, or `None` when the cell is
    /// blocked this turn (claimed, or foreign-occupied unless hunting).
    fn entry_cost(&self, position: Position) -> Option<u64> {
        let cell = self.grid.cell(position);
        if cell.is_claimed() {
            return None;
        }
        if let Some(occupant) = cell.occupant {
            if occupant.owner != self.me && !self.through_enemies {
                return None;
            }
        }
        let weight = match self.mode {
            CostMode::Cheapest => cell.resource,
            CostMode::Costliest => self.capacity.saturating_sub(cell.resource).max(1),
        };
        Some(u64::from(weight))
    }

    /// First step of a locally cheapest path from `source` to `target`.
    /// Among equally cheap paths the one with the fewest steps wins.
    #[must_use]
    pub fn first_step(&self, source: Position, target: Position) -> Direction {
        let source = self.grid.normalize(source);
        let target = self.grid.normalize(target);
        if source == target {
            return Direction::Still;
        }

        let window = SearchWindow::covering(self.grid, source, target, self.margin);
        let mut distances = vec![PathDistance::Unreachable; window.area()];
        let mut hops = vec![u32::MAX; window.area()];
        let mut previous: Vec<Option<usize>> = vec![None; window.area()];

        let Some(source_idx) = window.offset_of(self.grid, source) else {
            return Direction::Still;
        };
        let Some(target_idx) = window.offset_of(self.grid, target) else {
            return Direction::Still;
        };

        distances[source_idx] = PathDistance::Finite(0);
        hops[source_idx] = 0;
        let mut frontier = BinaryHeap::new();
        frontier.push(Reverse((0u64, 0u32, source_idx)));

        while let Some(Reverse((span, hop, idx))) = frontier.pop() {
            if distances[idx] != PathDistance::Finite(span) || hops[idx] != hop {
                continue;
            }
            let position = window.position_at(self.grid, idx);
            for direction in Direction::CARDINALS {
                let neighbor = self.grid.step(position, direction);
                if neighbor == source {
                    continue;
                }
                let Some(neighbor_idx) = window.offset_of(self.grid, neighbor) else {
                    continue;
                };
                let Some(weight) = self.entry_cost(neighbor) else {
                    continue;
                };
                let candidate = span + weight;
                // Equal-cost ties prefer fewer hops, so zero-cost terrain
                // still yields Manhattan-length paths.
                let better = match distances[neighbor_idx] {
                    PathDistance::Unreachable => true,
                    PathDistance::Finite(current) => {
                        candidate < current || (candidate == current && hop + 1 < hops[neighbor_idx])
                    }
                };
                if better {
                    distances[neighbor_idx] = PathDistance::Finite(candidate);
                    hops[neighbor_idx] = hop + 1;
                    previous[neighbor_idx] = Some(idx);
                    frontier.push(Reverse((candidate, hop + 1, neighbor_idx)));
                }
            }
        }

        if distances[target_idx] == PathDistance::Unreachable {
            return Direction::Still;
        }

        // Walk predecessors back from the target until the node adjacent to
        // the source. The walk is bounded so a malformed predecessor chain
        // cannot loop forever.
        let mut cursor = target_idx;
        let mut walked = 0usize;
        while let Some(prev) = previous[cursor] {
            if prev == source_idx {
                let step = window.position_at(self.grid, cursor);
                return self.direction_between(source, step);
            }
            cursor = prev;
            walked += 1;
            if walked > window.area() {
                break;
            }
        }
        Direction::Still
    }

    fn direction_between(&self, source: Position, adjacent: Position) -> Direction {
        for direction in Direction::CARDINALS {
            if self.grid.step(source, direction) == adjacent {
                return direction;
            }
        }
        Direction::Still
    }
}

/// Behavioural state of a ship, recomputed every turn from current facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Collect resource from the map.
    Gather,
    /// Carry cargo back to the home base.
    Deposit,
    /// Endgame: run for home and deliberately end on a structure to deny
    /// the cargo to opponents.
    Suicide,
    /// Endgame: harass nearby high-cargo enemy ships.
    EndgameHunt,
}

/// Facts the classifier derives a task from.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    pub previous: Option<Task>,
    pub cargo: u32,
    pub at_home: bool,
    pub home_distance: u32,
    pub fleet_size: usize,
    pub turns_remaining: u32,
}

/// Assign a task for this turn, or `None` when no rule fires (the
/// orchestrator treats that as gathering).
///
/// Rules fire in priority order: endgame commitment first, then deposit,
/// then gather. The function is pure: identical inputs always yield the
/// identical state.
#[must_use]
pub fn classify_task(context: &TaskContext, config: &EngineConfig) -> Option<Task> {
    let congestion = (context.fleet_size as u32).div_ceil(config.congestion_divisor);
    let homing_time = context.home_distance + config.homing_buffer + congestion;
    let committed = matches!(context.previous, Some(Task::Suicide | Task::EndgameHunt));

    if committed {
        return context.previous;
    }
    if homing_time >= context.turns_remaining {
        return Some(if context.cargo > config.salvage_threshold {
            Task::Suicide
        } else {
            Task::EndgameHunt
        });
    }

    let deposit_mark = config.deposit_fraction * f64::from(config.cargo_capacity);
    if f64::from(context.cargo) >= deposit_mark
        || (context.previous == Some(Task::Deposit) && !context.at_home)
    {
        return Some(Task::Deposit);
    }

    if context.at_home || context.previous == Some(Task::Gather) {
        return Some(Task::Gather);
    }
    None
}

/// How gatherers are matched to destination cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatcherStrategy {
    /// Score every free cell, keep the best `2N`, hand each ship its
    /// nearest retained candidate.
    #[default]
    RankedScan,
    /// Descend a per-turn [`ResourcePyramid`] toward the densest
    /// distance-discounted region. Coarser, but `O(log n)` per ship.
    AggregateDescent,
}

/// Greedy ranked-scan assignment.
///
/// Candidates are unoccupied, unclaimed cells scored by
/// `resource / max(1, distance_to_home)`; the pool is truncated to twice
/// the number of ships to bound the scan. Ships are served in the order
/// given, each taking its nearest candidate. Greedy by construction, so
/// a later ship may be left a worse pick than a different order would
/// allow.
fn ranked_scan_targets(
    grid: &Grid,
    home: Position,
    agents: &[(ShipKey, Position)],
) -> ShipMap<Position> {
    let mut candidates: Vec<(Position, OrderedFloat<f64>)> = Vec::new();
    for y in 0..grid.height() as i32 {
        for x in 0..grid.width() as i32 {
            let position = Position::new(x, y);
            let cell = grid.cell(position);
            if cell.is_occupied() || cell.is_claimed() {
                continue;
            }
            let span = grid.distance(home, position).max(1);
            candidates.push((
                position,
                OrderedFloat(f64::from(cell.resource) / f64::from(span)),
            ));
        }
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    candidates.truncate(agents.len() * 2);

    let mut assignments = ShipMap::new();
    for &(key, position) in agents {
        let mut best: Option<(usize, u32)> = None;
        for (idx, &(candidate, _)) in candidates.iter().enumerate() {
            let span = grid.distance(position, candidate);
            if best.is_none_or(|(_, closest)| span < closest) {
                best = Some((idx, span));
            }
        }
        if let Some((idx, _)) = best {
            let (chosen, _) = candidates.remove(idx);
            assignments.insert(key, chosen);
        }
    }
    assignments
}

/// Static engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum cargo a ship can carry.
    pub cargo_capacity: u32,
    /// Bank cost of spawning one ship.
    pub spawn_cost: u32,
    /// Fraction of capacity at which a ship turns for home.
    pub deposit_fraction: f64,
    /// Cargo above which an endgame ship self-destructs on a structure
    /// instead of hunting.
    pub salvage_threshold: u32,
    /// Minimum cargo an enemy ship must carry to be worth hunting.
    pub hunt_cargo_floor: u32,
    /// Fixed slack added to the projected turns-to-reach-home.
    pub homing_buffer: u32,
    /// Fleet-size divisor for the endgame congestion term.
    pub congestion_divisor: u32,
    /// Starting value of the dynamic station-keeping floor.
    pub idle_floor: u32,
    /// Map richness per ship required before requesting a spawn.
    pub spawn_resource_per_ship: u64,
    /// Fraction of the game during which spawning is allowed.
    pub spawn_turn_fraction: f64,
    /// Default search-window padding for path planning.
    pub path_margin: u32,
    /// Per-step distance discount used by aggregate descent.
    pub descent_discount: f64,
    /// Gatherer target-matching strategy.
    pub matcher: MatcherStrategy,
    /// Soft wall-clock budget for one turn; `None` disables truncation.
    pub turn_budget: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cargo_capacity: 1_000,
            spawn_cost: 1_000,
            deposit_fraction: 0.95,
            salvage_threshold: 200,
            hunt_cargo_floor: 200,
            homing_buffer: 6,
            congestion_divisor: 9,
            idle_floor: 50,
            spawn_resource_per_ship: 4_000,
            spawn_turn_fraction: 0.66,
            path_margin: 1,
            descent_discount: 0.9,
            matcher: MatcherStrategy::default(),
            turn_budget: None,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.cargo_capacity == 0 {
            return Err(EngineError::InvalidConfig("cargo_capacity must be non-zero"));
        }
        if self.spawn_cost == 0 {
            return Err(EngineError::InvalidConfig("spawn_cost must be non-zero"));
        }
        if !(self.deposit_fraction > 0.0 && self.deposit_fraction <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "deposit_fraction must lie in (0, 1]",
            ));
        }
        if self.congestion_divisor == 0 {
            return Err(EngineError::InvalidConfig(
                "congestion_divisor must be non-zero",
            ));
        }
        if !(self.spawn_turn_fraction > 0.0 && self.spawn_turn_fraction <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "spawn_turn_fraction must lie in (0, 1]",
            ));
        }
        if !(self.descent_discount > 0.0 && self.descent_discount < 1.0) {
            return Err(EngineError::InvalidConfig(
                "descent_discount must lie in (0, 1)",
            ));
        }
        if self.turn_budget.is_some_and(|budget| budget.is_zero()) {
            return Err(EngineError::InvalidConfig(
                "turn_budget must be positive when set",
            ));
        }
        Ok(())
    }
}

/// One turn's worth of world state as delivered by the host simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub turn: u32,
    pub max_turns: u32,
    /// The player this engine is planning for.
    pub me: PlayerId,
    /// Banked resource available for spawning.
    pub bank: u32,
    pub width: u32,
    pub height: u32,
    /// Row-major per-cell resource quantities.
    pub resources: Vec<u32>,
    /// Every ship on the map, all players.
    pub ships: Vec<ShipObservation>,
    /// Every structure on the map, all players.
    pub structures: Vec<Structure>,
}

impl TurnSnapshot {
    fn in_bounds(&self, position: Position) -> bool {
        (0..self.width as i32).contains(&position.x) && (0..self.height as i32).contains(&position.y)
    }

    /// Enforce the input contract. Out-of-range positions are a fatal
    /// violation, not something the planner should paper over.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::MalformedSnapshot(
                "grid dimensions must be non-zero",
            ));
        }
        if self.resources.len() != (self.width as usize) * (self.height as usize) {
            return Err(EngineError::MalformedSnapshot(
                "resource grid length must equal width * height",
            ));
        }
        if self.ships.iter().any(|ship| !self.in_bounds(ship.position)) {
            return Err(EngineError::MalformedSnapshot(
                "ship position out of range",
            ));
        }
        if self
            .structures
            .iter()
            .any(|structure| !self.in_bounds(structure.position))
        {
            return Err(EngineError::MalformedSnapshot(
                "structure position out of range",
            ));
        }
        let has_home = self.structures.iter().any(|structure| {
            structure.owner == self.me && structure.kind == StructureKind::Shipyard
        });
        if !has_home {
            return Err(EngineError::MalformedSnapshot(
                "snapshot carries no home shipyard for the planning player",
            ));
        }
        Ok(())
    }
}

/// A finalized single-ship order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub ship: ShipId,
    pub direction: Direction,
}

/// Counters describing how a turn went; useful for logging and regression
/// baselines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn: u32,
    /// Owned ships in the snapshot.
    pub fleet: usize,
    /// Ships finalized as stationary by the affordability and
    /// station-keeping filters.
    pub holds: usize,
    /// Planned moves replaced by a fallback (including forced stays).
    pub stalls: usize,
    /// Whether the wall-clock budget cut the pipeline short.
    pub truncated: bool,
}

/// Everything `plan_turn` produces for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnPlan {
    /// One command per owned ship, in finalization order.
    pub commands: Vec<Command>,
    /// Whether the spawn heuristic asks the host for a new ship.
    pub spawn_requested: bool,
    pub summary: TurnSummary,
}

/// Per-turn working state threaded through the orchestrator stages. Lives
/// exactly one turn; rebuilt from the next snapshot.
struct TurnState {
    grid: Grid,
    ships: SlotMap<ShipKey, Ship>,
    /// Ships not yet finalized. Every stage shrinks this set.
    pending: Vec<ShipKey>,
    commands: Vec<Command>,
    home: Position,
    /// Enemy ships available as hunt targets.
    enemy_ships: Vec<(Position, u32)>,
    deadline: Option<Instant>,
    truncated: bool,
    holds: usize,
    stalls: usize,
}

impl TurnState {
    fn ingest(snapshot: &TurnSnapshot, deadline: Option<Instant>) -> Result<Self, EngineError> {
        snapshot.validate()?;
        let mut grid = Grid::new(snapshot.width, snapshot.height, &snapshot.resources)?;

        let mut home = None;
        for structure in &snapshot.structures {
            grid.cell_mut(structure.position).structure = Some(*structure);
            if structure.owner == snapshot.me && structure.kind == StructureKind::Shipyard {
                home = Some(structure.position);
            }
        }
        // validate() guarantees the home shipyard exists.
        let home = home.ok_or(EngineError::MalformedSnapshot(
            "snapshot carries no home shipyard for the planning player",
        ))?;

        let mut ships = SlotMap::with_key();
        let mut pending = Vec::new();
        let mut enemy_ships = Vec::new();
        for observation in &snapshot.ships {
            if observation.owner == snapshot.me {
                let key = ships.insert(Ship {
                    id: observation.id,
                    owner: observation.owner,
                    position: observation.position,
                    cargo: observation.cargo,
                    task: None,
                });
                pending.push(key);
                grid.cell_mut(observation.position).occupant = Some(Occupant {
                    owner: observation.owner,
                    cargo: observation.cargo,
                    key: Some(key),
                });
            } else {
                enemy_ships.push((observation.position, observation.cargo));
                grid.cell_mut(observation.position).occupant = Some(Occupant {
                    owner: observation.owner,
                    cargo: observation.cargo,
                    key: None,
                });
            }
        }

        Ok(Self {
            grid,
            ships,
            pending,
            commands: Vec::new(),
            home,
            enemy_ships,
            deadline,
            truncated: false,
            holds: 0,
            stalls: 0,
        })
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Register the claim for a finalized direction and emit the command.
    fn commit(&mut self, key: ShipKey, direction: Direction, crash_on_structure: bool) {
        let ship = self.ships[key];
        self.grid
            .register_move(key, ship.position, direction, crash_on_structure);
        self.commands.push(Command {
            ship: ship.id,
            direction,
        });
    }

    /// Check a planned direction against the claim ledger and finalize it,
    /// falling back to a safe greedy move when the destination is unsafe.
    fn route_and_commit(
        &mut self,
        key: ShipKey,
        planned: Direction,
        target: Position,
        me: PlayerId,
        suicide: bool,
        hunter: bool,
    ) {
        let source = self.ships[key].position;
        let destination = self.grid.step(source, planned);
        let cell = *self.grid.cell(destination);

        if suicide && cell.has_structure() {
            self.commit(key, planned, true);
            return;
        }

        let safe = !cell.is_claimed()
            && match cell.occupant {
                None => true,
                Some(occupant) => occupant.owner == me || hunter,
            };
        if safe {
            self.commit(key, planned, false);
            return;
        }

        self.stalls += 1;
        match self.grid.safe_greedy_move(source, target, me) {
            Some(fallback) => self.commit(key, fallback, false),
            None => {
                // Claim on the source cell was released inside
                // safe_greedy_move; re-claiming would overwrite whoever
                // holds it now.
                warn!(ship = self.ships[key].id.0, x = source.x, y = source.y,
                      "no safe move available, holding position");
                self.commands.push(Command {
                    ship: self.ships[key].id,
                    direction: Direction::Still,
                });
            }
        }
    }

    fn remove_pending(&mut self, processed: &[ShipKey]) {
        self.pending.retain(|key| !processed.contains(key));
    }
}

/// The turn orchestrator.
///
/// Owns the configuration and the cross-turn task memory; everything else
/// is rebuilt per turn. `plan_turn` is the only entry point the host
/// needs.
pub struct Engine {
    config: EngineConfig,
    tasks: HashMap<ShipId, Task>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            tasks: HashMap::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Task remembered for a ship after the most recent turn.
    #[must_use]
    pub fn task_of(&self, ship: ShipId) -> Option<Task> {
        self.tasks.get(&ship).copied()
    }

    /// Compute one command per owned ship for this turn.
    ///
    /// Stages run in fixed order, each finalizing ships the later stages
    /// no longer see. If the configured wall-clock budget runs out,
    /// remaining stages are skipped and unprocessed ships hold position;
    /// a late-but-valid command set beats a missed turn.
    pub fn plan_turn(&mut self, snapshot: &TurnSnapshot) -> Result<TurnPlan, EngineError> {
        let deadline = self.config.turn_budget.map(|budget| Instant::now() + budget);
        let mut state = TurnState::ingest(snapshot, deadline)?;
        state.grid.reset_claims();

        for ship in state.ships.values_mut() {
            ship.task = self.tasks.get(&ship.id).copied();
        }

        self.stage_affordability(&mut state);
        self.stage_station_keeping(&mut state);
        self.stage_classify(&mut state, snapshot);
        self.stage_homebound(&mut state, snapshot);
        self.stage_hunt(&mut state, snapshot);
        self.stage_gather(&mut state, snapshot);
        self.finalize_stragglers(&mut state);

        let spawn_requested = self.evaluate_spawn(&state, snapshot);

        self.tasks = state
            .ships
            .values()
            .filter_map(|ship| ship.task.map(|task| (ship.id, task)))
            .collect();

        let summary = TurnSummary {
            turn: snapshot.turn,
            fleet: state.ships.len(),
            holds: state.holds,
            stalls: state.stalls,
            truncated: state.truncated,
        };
        debug!(
            turn = summary.turn,
            fleet = summary.fleet,
            holds = summary.holds,
            stalls = summary.stalls,
            truncated = summary.truncated,
            spawn = spawn_requested,
            "turn planned"
        );
        Ok(TurnPlan {
            commands: state.commands,
            spawn_requested,
            summary,
        })
    }

    /// Ships that cannot pay the departure cost hold position immediately.
    fn stage_affordability(&self, state: &mut TurnState) {
        if state.expired() {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        let mut kept = Vec::with_capacity(pending.len());
        for key in pending {
            let ship = state.ships[key];
            if move_cost(state.grid.cell(ship.position).resource) > ship.cargo {
                state.commit(key, Direction::Still, false);
                state.holds += 1;
            } else {
                kept.push(key);
            }
        }
        state.pending = kept;
    }

    /// Ships sitting on terrain still worth working hold position unless
    /// their task demands movement.
    ///
    /// The floor starts at `idle_floor` and halves (integer division)
    /// while the average map richness is at or below it; on a depleted
    /// map it reaches zero and station-keeping switches off entirely.
    fn stage_station_keeping(&self, state: &mut TurnState) {
        if state.expired() {
            return;
        }
        let average = state.grid.average_resource();
        let mut floor = u64::from(self.config.idle_floor);
        while floor > 0 && average <= floor {
            floor /= 2;
        }

        let pending = std::mem::take(&mut state.pending);
        let mut kept = Vec::with_capacity(pending.len());
        for key in pending {
            let ship = state.ships[key];
            let restless = matches!(
                ship.task,
                Some(Task::Deposit | Task::Suicide | Task::EndgameHunt)
            );
            let worth_working = floor > 0
                && u64::from(state.grid.cell(ship.position).resource) >= floor
                && ship.cargo < self.config.cargo_capacity;
            if !restless && worth_working {
                state.commit(key, Direction::Still, false);
                state.holds += 1;
            } else {
                kept.push(key);
            }
        }
        state.pending = kept;
    }

    fn stage_classify(&self, state: &mut TurnState, snapshot: &TurnSnapshot) {
        if state.expired() {
            return;
        }
        let fleet_size = state.ships.len();
        let turns_remaining = snapshot.max_turns.saturating_sub(snapshot.turn);
        for &key in &state.pending {
            let ship = state.ships[key];
            let context = TaskContext {
                previous: ship.task,
                cargo: ship.cargo,
                at_home: ship.position == state.home,
                home_distance: state.grid.distance(ship.position, state.home),
                fleet_size,
                turns_remaining,
            };
            let task = classify_task(&context, &self.config);
            state.ships[key].task = task;
        }
    }

    /// Deposit and suicide ships run for home, nearest first so inner
    /// ships clear the lanes before outer ones arrive.
    fn stage_homebound(&self, state: &mut TurnState, snapshot: &TurnSnapshot) {
        if state.expired() {
            return;
        }
        let mut cohort: Vec<ShipKey> = state
            .pending
            .iter()
            .copied()
            .filter(|&key| {
                matches!(state.ships[key].task, Some(Task::Deposit | Task::Suicide))
            })
            .collect();
        cohort.sort_by_key(|&key| state.grid.distance(state.ships[key].position, state.home));

        for &key in &cohort {
            if state.expired() {
                break;
            }
            let ship = state.ships[key];
            let suicide = ship.task == Some(Task::Suicide);
            let planned = PathPlanner::new(&state.grid, snapshot.me, self.config.cargo_capacity)
                .margin(self.config.path_margin)
                .first_step(ship.position, state.home);
            let home = state.home;
            state.route_and_commit(key, planned, home, snapshot.me, suicide, false);
        }
        state.remove_pending(&cohort);
    }

    /// Hunters pair off with the nearest worthwhile enemy ship, one
    /// hunter per target.
    fn stage_hunt(&self, state: &mut TurnState, snapshot: &TurnSnapshot) {
        if state.expired() {
            return;
        }
        let mut cohort: Vec<ShipKey> = state
            .pending
            .iter()
            .copied()
            .filter(|&key| state.ships[key].task == Some(Task::EndgameHunt))
            .collect();
        cohort.sort_by_key(|&key| state.grid.distance(state.ships[key].position, state.home));

        let mut targets: Vec<(Position, u32)> = state
            .enemy_ships
            .iter()
            .copied()
            .filter(|&(_, cargo)| cargo > self.config.hunt_cargo_floor)
            .collect();

        for &key in &cohort {
            if state.expired() {
                break;
            }
            let ship = state.ships[key];
            let mut best: Option<(usize, u32)> = None;
            for (idx, &(position, _)) in targets.iter().enumerate() {
                let span = state.grid.distance(ship.position, position);
                if best.is_none_or(|(_, closest)| span < closest) {
                    best = Some((idx, span));
                }
            }
            match best {
                Some((idx, _)) => {
                    let (target, _) = targets.remove(idx);
                    let planned =
                        PathPlanner::new(&state.grid, snapshot.me, self.config.cargo_capacity)
                            .margin(self.config.path_margin)
                            .through_enemies()
                            .first_step(ship.position, target);
                    state.route_and_commit(key, planned, target, snapshot.me, false, true);
                }
                None => {
                    debug!(ship = ship.id.0, "no hunt target in range, holding");
                    state.commit(key, Direction::Still, false);
                }
            }
        }
        state.remove_pending(&cohort);
    }

    /// Remaining ships gather. Farthest-from-home ships pick targets
    /// first; ships departing the home cell plan with zero margin.
    fn stage_gather(&self, state: &mut TurnState, snapshot: &TurnSnapshot) {
        if state.expired() {
            return;
        }
        let mut cohort: Vec<ShipKey> = state
            .pending
            .iter()
            .copied()
            .filter(|&key| {
                matches!(state.ships[key].task, Some(Task::Gather) | None)
            })
            .collect();
        cohort.sort_by_key(|&key| {
            Reverse(state.grid.distance(state.ships[key].position, state.home))
        });

        let agents: Vec<(ShipKey, Position)> = cohort
            .iter()
            .map(|&key| (key, state.ships[key].position))
            .collect();
        let assignments = self.match_targets(state, &agents);

        for &key in &cohort {
            if state.expired() {
                break;
            }
            match assignments.get(key).copied() {
                Some(target) => {
                    let ship = state.ships[key];
                    let margin = if ship.position == state.home {
                        0
                    } else {
                        self.config.path_margin
                    };
                    let planned =
                        PathPlanner::new(&state.grid, snapshot.me, self.config.cargo_capacity)
                            .margin(margin)
                            .mode(CostMode::Costliest)
                            .first_step(ship.position, target);
                    state.route_and_commit(key, planned, target, snapshot.me, false, false);
                }
                None => {
                    debug!(ship = state.ships[key].id.0, "no gather target, holding");
                    state.commit(key, Direction::Still, false);
                }
            }
        }
        state.remove_pending(&cohort);
    }

    fn match_targets(&self, state: &TurnState, agents: &[(ShipKey, Position)]) -> ShipMap<Position> {
        match self.config.matcher {
            MatcherStrategy::RankedScan => ranked_scan_targets(&state.grid, state.home, agents),
            MatcherStrategy::AggregateDescent => {
                if state.grid.width() != state.grid.height() {
                    warn!(
                        width = state.grid.width(),
                        height = state.grid.height(),
                        "aggregate descent needs a square grid, falling back to ranked scan"
                    );
                    return ranked_scan_targets(&state.grid, state.home, agents);
                }
                let side = state.grid.width();
                let cells: Vec<u32> = (0..side as i32)
                    .flat_map(|y| {
                        let grid = &state.grid;
                        (0..side as i32).map(move |x| grid.cell(Position::new(x, y)).resource)
                    })
                    .collect();
                match ResourcePyramid::from_cells(side, &cells) {
                    Ok(mut pyramid) => {
                        let mut assignments = ShipMap::new();
                        for &(key, position) in agents {
                            let from = (position.x as u32, position.y as u32);
                            if let Some((x, y)) =
                                pyramid.follow_max(from, self.config.descent_discount)
                            {
                                assignments.insert(key, Position::new(x as i32, y as i32));
                            }
                        }
                        assignments
                    }
                    Err(error) => {
                        warn!(%error, "resource pyramid build failed, falling back to ranked scan");
                        ranked_scan_targets(&state.grid, state.home, agents)
                    }
                }
            }
        }
    }

    /// Anything still pending (budget overrun) holds position.
    fn finalize_stragglers(&self, state: &mut TurnState) {
        if state.pending.is_empty() {
            return;
        }
        state.truncated = state.expired();
        if state.truncated {
            warn!(
                remaining = state.pending.len(),
                "turn budget exhausted, remaining ships hold position"
            );
        }
        let pending = std::mem::take(&mut state.pending);
        for key in pending {
            state.commit(key, Direction::Still, false);
        }
    }

    /// Spawn-economy threshold check, evaluated after all moves are
    /// claimed so the home cell's claim state is final.
    fn evaluate_spawn(&self, state: &TurnState, snapshot: &TurnSnapshot) -> bool {
        let grid = &state.grid;
        let ringed = Direction::CARDINALS
            .iter()
            .all(|&direction| grid.cell(grid.step(state.home, direction)).is_claimed());
        if ringed {
            debug!("home base ringed by claims, skipping spawn");
            return false;
        }
        let fleet = state.ships.len().max(1) as u64;
        let richness = grid.total_resource() / fleet;
        let horizon =
            (self.config.spawn_turn_fraction * f64::from(snapshot.max_turns)).ceil() as u32;
        let home_cell = grid.cell(state.home);
        richness > self.config.spawn_resource_per_ship
            && snapshot.bank >= self.config.spawn_cost
            && !home_cell.is_occupied()
            && !home_cell.is_claimed()
            && snapshot.turn <= horizon
    }
}
