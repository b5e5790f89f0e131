//! The tile world an instance plays on. The world-file loader lives outside
//! this server, so maps come from a built-in catalog of generated arenas;
//! each carries a stable filename that is reported to clients in
//! `WORLD_INFO` so they can load the matching visuals.
//!
//! Tiles are stored as atomics because fence placement overwrites tiles
//! while the projectile tick reads walkability concurrently.

use rand::Rng;
use std::sync::atomic::{AtomicU8, Ordering};

/// Tile ids on the grid and on the wire (`TILE_UPDATE.tile`).
pub const TILE_FLOOR: u8 = 0;
pub const TILE_WALL: u8 = 1;
pub const TILE_FENCE: u8 = 2;

/// A mutable tile grid with immutable dimensions.
pub struct World {
    filename: &'static str,
    width: i32,
    height: i32,
    tiles: Vec<AtomicU8>,
}

impl World {
    fn new(filename: &'static str, width: i32, height: i32) -> World {
        let tiles = (0..(width * height) as usize)
            .map(|_| AtomicU8::new(TILE_FLOOR))
            .collect();
        World {
            filename,
            width,
            height,
            tiles,
        }
    }

    pub fn filename(&self) -> &'static str {
        self.filename
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Total tile count, used to scale the item spawn batch.
    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && x < self.width && y >= 0 && y < self.height
    }

    fn index(&self, x: i32, y: i32) -> usize {
        (y * self.width + x) as usize
    }

    /// The tile id at the coordinates; out of bounds reads as a wall.
    pub fn tile(&self, x: i32, y: i32) -> u8 {
        if !self.in_bounds(x, y) {
            return TILE_WALL;
        }
        self.tiles[self.index(x, y)].load(Ordering::Relaxed)
    }

    /// Overwrites one tile. Out-of-bounds writes are ignored.
    pub fn set_tile(&self, x: i32, y: i32, tile: u8) {
        if self.in_bounds(x, y) {
            self.tiles[self.index(x, y)].store(tile, Ordering::Relaxed);
        }
    }

    /// False for out-of-bounds coordinates, walls and fences.
    pub fn is_walkable(&self, x: i32, y: i32) -> bool {
        self.tile(x, y) == TILE_FLOOR
    }

    pub fn is_fence(&self, x: i32, y: i32) -> bool {
        self.tile(x, y) == TILE_FENCE
    }

    /// Picks a uniformly random walkable tile, bounded retries.
    pub fn random_walkable<R: Rng>(&self, rng: &mut R) -> Option<(i32, i32)> {
        for _ in 0..100 {
            let x = rng.gen_range(0..self.width);
            let y = rng.gen_range(0..self.height);
            if self.is_walkable(x, y) {
                return Some((x, y));
            }
        }
        None
    }

    /// Picks a spawn point that no listed position occupies. Falls back to
    /// any walkable tile when the world is crowded.
    pub fn pick_spawn<R: Rng>(&self, occupied: &[(i32, i32)], rng: &mut R) -> (i32, i32) {
        for _ in 0..100 {
            let x = rng.gen_range(0..self.width);
            let y = rng.gen_range(0..self.height);
            if self.is_walkable(x, y) && !occupied.contains(&(x, y)) {
                return (x, y);
            }
        }
        self.random_walkable(rng).unwrap_or((1, 1))
    }
}

/// One entry of the built-in map catalog.
struct MapSpec {
    filename: &'static str,
    width: i32,
    height: i32,
    build: fn(&World),
}

const MAPS: &[MapSpec] = &[
    MapSpec {
        filename: "crossfire_32.map",
        width: 32,
        height: 32,
        build: build_crossfire,
    },
    MapSpec {
        filename: "bastion_48.map",
        width: 48,
        height: 48,
        build: build_bastion,
    },
    MapSpec {
        filename: "rift_64.map",
        width: 64,
        height: 64,
        build: build_rift,
    },
];

/// Number of maps a `LOBBY_ACTION.map_index` may refer to.
pub fn map_count() -> u8 {
    MAPS.len() as u8
}

/// True when a client-supplied map index refers to a known map.
pub fn is_valid_map(index: u8) -> bool {
    (index as usize) < MAPS.len()
}

/// Builds a fresh world for the map index. Every instance gets its own
/// mutable copy since fences change tiles mid-game.
pub fn instantiate(index: u8) -> Option<World> {
    let spec = MAPS.get(index as usize)?;
    let world = World::new(spec.filename, spec.width, spec.height);
    seal_border(&world);
    (spec.build)(&world);
    Some(world)
}

fn seal_border(world: &World) {
    for x in 0..world.width() {
        world.set_tile(x, 0, TILE_WALL);
        world.set_tile(x, world.height() - 1, TILE_WALL);
    }
    for y in 0..world.height() {
        world.set_tile(0, y, TILE_WALL);
        world.set_tile(world.width() - 1, y, TILE_WALL);
    }
}

/// Small arena: a pillar every eight tiles.
fn build_crossfire(world: &World) {
    for y in (4..world.height() - 1).step_by(8) {
        for x in (4..world.width() - 1).step_by(8) {
            world.set_tile(x, y, TILE_WALL);
            world.set_tile(x + 1, y, TILE_WALL);
            world.set_tile(x, y + 1, TILE_WALL);
        }
    }
}

/// Medium arena: a walled keep in the center with four gates.
fn build_bastion(world: &World) {
    let (cx, cy) = (world.width() / 2, world.height() / 2);
    let r = 8;
    for x in (cx - r)..=(cx + r) {
        world.set_tile(x, cy - r, TILE_WALL);
        world.set_tile(x, cy + r, TILE_WALL);
    }
    for y in (cy - r)..=(cy + r) {
        world.set_tile(cx - r, y, TILE_WALL);
        world.set_tile(cx + r, y, TILE_WALL);
    }
    // Gates in the middle of each wall.
    world.set_tile(cx, cy - r, TILE_FLOOR);
    world.set_tile(cx, cy + r, TILE_FLOOR);
    world.set_tile(cx - r, cy, TILE_FLOOR);
    world.set_tile(cx + r, cy, TILE_FLOOR);
}

/// Large arena: two long diagonal wall runs with regular breaches.
fn build_rift(world: &World) {
    for i in 4..world.width() - 4 {
        if i % 6 != 0 {
            world.set_tile(i, i / 2 + 8, TILE_WALL);
            world.set_tile(world.width() - 1 - i, i / 2 + 24, TILE_WALL);
        }
    }
}
