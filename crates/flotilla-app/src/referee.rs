//! Minimal local referee for demo matches.
//!
//! Implements just enough of the host simulation's rules to exercise the
//! engine end to end: movement charging, mining, deposits, collisions and
//! spawning. The real game server owns these rules; this referee exists so
//! the demo binary can run self-contained matches.

use flotilla_core::{
    Direction, PlayerId, Position, ShipId, ShipObservation, Structure, StructureKind, TurnPlan,
    TurnSnapshot, move_cost,
};
use rand::{Rng, SeedableRng, rngs::SmallRng};

const CARGO_CAPACITY: u32 = 1_000;
const SPAWN_COST: u32 = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct MatchSetup {
    pub side: u32,
    pub max_turns: u32,
    pub seed: u64,
}

impl Default for MatchSetup {
    fn default() -> Self {
        Self {
            side: 32,
            max_turns: 400,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MatchShip {
    id: ShipId,
    owner: PlayerId,
    position: Position,
    cargo: u32,
}

/// Authoritative match state for two players.
pub struct Referee {
    side: u32,
    max_turns: u32,
    turn: u32,
    resources: Vec<u32>,
    ships: Vec<MatchShip>,
    banks: [u32; 2],
    bases: [Position; 2],
    next_ship_id: u32,
}

impl Referee {
    /// Generate a randomized map: low background noise plus a handful of
    /// rich blobs, mirroring the lumpy fields the engine is tuned for.
    pub fn generate(setup: MatchSetup) -> Self {
        let mut rng = SmallRng::seed_from_u64(setup.seed);
        let side = setup.side;
        let area = (side as usize) * (side as usize);
        let mut resources: Vec<u32> = (0..area).map(|_| rng.random_range(0..120)).collect();
        for _ in 0..(side / 2).max(4) {
            let x = rng.random_range(0..side) as usize;
            let y = rng.random_range(0..side) as usize;
            resources[y * side as usize + x] = rng.random_range(400..900);
        }

        let quarter = (side / 4) as i32;
        let mid = (side / 2) as i32;
        let bases = [
            Position::new(quarter, mid),
            Position::new(3 * quarter, mid),
        ];
        for base in &bases {
            resources[(base.y * side as i32 + base.x) as usize] = 0;
        }

        Self {
            side,
            max_turns: setup.max_turns,
            turn: 1,
            resources,
            ships: Vec::new(),
            banks: [5_000, 5_000],
            bases,
            next_ship_id: 0,
        }
    }

    #[must_use]
    pub const fn turn(&self) -> u32 {
        self.turn
    }

    #[must_use]
    pub const fn is_over(&self) -> bool {
        self.turn > self.max_turns
    }

    #[must_use]
    pub fn bank(&self, player: usize) -> u32 {
        self.banks[player]
    }

    #[must_use]
    pub fn fleet(&self, player: usize) -> usize {
        self.ships
            .iter()
            .filter(|ship| ship.owner == PlayerId(player as u32))
            .count()
    }

    fn wrap(&self, position: Position) -> Position {
        let side = self.side as i32;
        Position::new(position.x.rem_euclid(side), position.y.rem_euclid(side))
    }

    fn cell_index(&self, position: Position) -> usize {
        let p = self.wrap(position);
        p.y as usize * self.side as usize + p.x as usize
    }

    /// Build the turn snapshot as seen by one player.
    #[must_use]
    pub fn snapshot_for(&self, player: usize) -> TurnSnapshot {
        TurnSnapshot {
            turn: self.turn,
            max_turns: self.max_turns,
            me: PlayerId(player as u32),
            bank: self.banks[player],
            width: self.side,
            height: self.side,
            resources: self.resources.clone(),
            ships: self
                .ships
                .iter()
                .map(|ship| ShipObservation {
                    id: ship.id,
                    owner: ship.owner,
                    position: ship.position,
                    cargo: ship.cargo,
                })
                .collect(),
            structures: self
                .bases
                .iter()
                .enumerate()
                .map(|(owner, &position)| Structure {
                    owner: PlayerId(owner as u32),
                    position,
                    kind: StructureKind::Shipyard,
                })
                .collect(),
        }
    }

    /// Apply both players' plans and advance one turn.
    pub fn step(&mut self, plans: [&TurnPlan; 2]) {
        // Movement, charged against cargo; unaffordable moves degrade to
        // staying put.
        for ship in &mut self.ships {
            let plan = plans[ship.owner.0 as usize];
            let direction = plan
                .commands
                .iter()
                .find(|command| command.ship == ship.id)
                .map_or(Direction::Still, |command| command.direction);
            if direction == Direction::Still {
                continue;
            }
            let idx = ship.position.y as usize * self.side as usize + ship.position.x as usize;
            let cost = move_cost(self.resources[idx]);
            if ship.cargo >= cost {
                ship.cargo -= cost;
                let (dx, dy) = direction.offset();
                ship.position = Position::new(
                    (ship.position.x + dx).rem_euclid(self.side as i32),
                    (ship.position.y + dy).rem_euclid(self.side as i32),
                );
            }
        }

        // Mining: stationary ships extract a quarter of the cell, rounded
        // up, capped by remaining hold space.
        let mut moved = vec![false; self.ships.len()];
        for (idx, ship) in self.ships.iter().enumerate() {
            let plan = plans[ship.owner.0 as usize];
            moved[idx] = plan
                .commands
                .iter()
                .find(|command| command.ship == ship.id)
                .is_some_and(|command| command.direction != Direction::Still);
        }
        for (idx, ship) in self.ships.iter_mut().enumerate() {
            if moved[idx] {
                continue;
            }
            let cell = ship.position.y as usize * self.side as usize + ship.position.x as usize;
            let available = self.resources[cell];
            let mined = available
                .div_ceil(4)
                .min(CARGO_CAPACITY.saturating_sub(ship.cargo));
            ship.cargo += mined;
            self.resources[cell] -= mined;
        }

        // Collisions sink every ship on a contested cell; cargo spills
        // onto the terrain.
        let mut survivors = Vec::with_capacity(self.ships.len());
        for (idx, ship) in self.ships.iter().enumerate() {
            let contested = self
                .ships
                .iter()
                .enumerate()
                .any(|(other, candidate)| other != idx && candidate.position == ship.position);
            if contested {
                let cell = self.cell_index(ship.position);
                self.resources[cell] = self.resources[cell].saturating_add(ship.cargo);
            } else {
                survivors.push(*ship);
            }
        }
        self.ships = survivors;

        // Deposits.
        for ship in &mut self.ships {
            if ship.position == self.bases[ship.owner.0 as usize] {
                self.banks[ship.owner.0 as usize] += ship.cargo;
                ship.cargo = 0;
            }
        }

        // Spawns.
        for (player, plan) in plans.iter().enumerate() {
            if !plan.spawn_requested || self.banks[player] < SPAWN_COST {
                continue;
            }
            let base = self.bases[player];
            if self.ships.iter().any(|ship| ship.position == base) {
                continue;
            }
            self.banks[player] -= SPAWN_COST;
            self.ships.push(MatchShip {
                id: ShipId(self.next_ship_id),
                owner: PlayerId(player as u32),
                position: base,
                cargo: 0,
            });
            self.next_ship_id += 1;
        }

        self.turn += 1;
    }
}
