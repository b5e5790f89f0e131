//! Fixed-cell hash grid for the projectile broad phase. Rebuilt once per
//! tick from the hittable player set and consumed only within that tick, so
//! it needs no synchronization. Cell buffers and the hittable array are
//! reused between rebuilds: cleared, never reallocated.

use crate::game::registry::PlayerState;
use std::collections::HashMap;
use std::sync::Arc;

/// Tiles per grid cell edge.
const CELL_EDGE: i32 = 4;

fn cell_key(cx: i32, cy: i32) -> u64 {
    ((cx as u64) << 32) | (cy as u32 as u64)
}

fn cell_of(coord: i32) -> i32 {
    coord.div_euclid(CELL_EDGE)
}

/// The broad-phase index. Cells map to indices into the hittable array so
/// the per-cell buffers stay small.
#[derive(Default)]
pub struct SpatialGrid {
    cells: HashMap<u64, Vec<usize>>,
    hittable: Vec<Arc<PlayerState>>,
}

impl SpatialGrid {
    pub fn new() -> SpatialGrid {
        SpatialGrid::default()
    }

    /// Rebuilds from the current player set, keeping only hittable players
    /// (alive, unshielded, not phased).
    pub fn rebuild<'a>(&mut self, players: impl Iterator<Item = &'a Arc<PlayerState>>, now: u64) {
        self.hittable.clear();
        for bucket in self.cells.values_mut() {
            bucket.clear();
        }
        for player in players {
            if !player.is_hittable(now) {
                continue;
            }
            let (x, y) = player.position();
            let key = cell_key(cell_of(x), cell_of(y));
            let index = self.hittable.len();
            self.hittable.push(player.clone());
            self.cells.entry(key).or_default().push(index);
        }
    }

    /// All hittable players of this tick, for area-of-effect sweeps.
    pub fn hittable(&self) -> &[Arc<PlayerState>] {
        &self.hittable
    }

    /// Visits every hittable player in the 3×3 cell neighborhood of the
    /// position, without allocating.
    pub fn for_each_nearby<F: FnMut(&Arc<PlayerState>)>(&self, x: f32, y: f32, mut f: F) {
        let cx = cell_of(x.floor() as i32);
        let cy = cell_of(y.floor() as i32);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let Some(bucket) = self.cells.get(&cell_key(cx + dx, cy + dy)) else {
                    continue;
                };
                for &index in bucket {
                    f(&self.hittable[index]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::registry::PlayerState;
    use protocol::{Color, PlayerId};

    fn player_at(id: u128, x: i32, y: i32) -> Arc<PlayerState> {
        Arc::new(PlayerState::new(
            PlayerId(id | 1 << 64),
            "p".into(),
            Color::default(),
            0,
            0,
            (x, y),
        ))
    }

    #[test]
    fn packed_key_separates_negative_cells() {
        assert_ne!(cell_key(-1, 0), cell_key(0, -1));
        assert_ne!(cell_key(-1, -1), cell_key(1, 1));
    }

    #[test]
    fn nearby_covers_the_neighborhood_and_not_beyond() {
        let mut grid = SpatialGrid::new();
        let close = player_at(1, 5, 5);
        let edge = player_at(2, 11, 11); // two cells over, still in 3×3
        let far = player_at(3, 30, 30);
        let players = vec![close.clone(), edge.clone(), far.clone()];
        grid.rebuild(players.iter(), 0);

        let mut seen = Vec::new();
        grid.for_each_nearby(5.0, 5.0, |p| seen.push(p.id));
        assert!(seen.contains(&close.id));
        assert!(seen.contains(&edge.id));
        assert!(!seen.contains(&far.id));
    }

    #[test]
    fn rebuild_drops_unhittable_players() {
        let mut grid = SpatialGrid::new();
        let alive = player_at(1, 3, 3);
        let dead = player_at(2, 3, 4);
        dead.apply_damage(1000);
        let shielded = player_at(3, 4, 3);
        shielded
            .shield_until
            .store(u64::MAX, std::sync::atomic::Ordering::Release);
        let players = vec![alive.clone(), dead, shielded];
        grid.rebuild(players.iter(), crate::clock::now_ms());
        assert_eq!(grid.hittable().len(), 1);
        assert_eq!(grid.hittable()[0].id, alive.id);
    }

    #[test]
    fn buffers_survive_rebuilds() {
        let mut grid = SpatialGrid::new();
        let a = player_at(1, 2, 2);
        grid.rebuild([a.clone()].iter(), 0);
        assert_eq!(grid.hittable().len(), 1);
        grid.rebuild([].iter(), 0);
        assert!(grid.hittable().is_empty());
        let mut count = 0;
        grid.for_each_nearby(2.0, 2.0, |_| count += 1);
        assert_eq!(count, 0);
    }
}
