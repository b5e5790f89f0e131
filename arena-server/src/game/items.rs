//! Authoritative item state: ground spawns, pickup arbitration and
//! per-player inventories. Effects of using an item live in the instance,
//! which owns the world and the player registry; this module only
//! arbitrates who holds what.

use crate::world::World;
use protocol::{ItemKind, PlayerId};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// One item lying in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub kind: ItemKind,
}

#[derive(Default)]
struct ItemState {
    on_ground: HashMap<u32, Item>,
    by_tile: HashMap<(i32, i32), u32>,
    inventories: HashMap<PlayerId, Vec<ItemKind>>,
}

pub struct ItemManager {
    state: Mutex<ItemState>,
    next_id: AtomicU32,
    inventory_cap: usize,
}

impl ItemManager {
    pub fn new(inventory_cap: usize) -> ItemManager {
        ItemManager {
            state: Mutex::new(ItemState::default()),
            next_id: AtomicU32::new(1),
            inventory_cap,
        }
    }

    fn weighted_kind<R: Rng>(rng: &mut R) -> ItemKind {
        match rng.gen_range(0..100) {
            0..30 => ItemKind::Heart,
            30..50 => ItemKind::Shield,
            50..70 => ItemKind::Gem,
            70..85 => ItemKind::Star,
            _ => ItemKind::Fence,
        }
    }

    /// Spawns up to `count` items on free random walkable tiles. Tiles that
    /// already hold an item are retried; a crowded world yields fewer
    /// items, never an error.
    pub fn spawn_batch<R: Rng>(&self, world: &World, count: usize, rng: &mut R) -> Vec<Item> {
        let mut state = self.state.lock().expect("item lock poisoned");
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            for _ in 0..100 {
                let Some((x, y)) = world.random_walkable(rng) else {
                    break;
                };
                if state.by_tile.contains_key(&(x, y)) {
                    continue;
                }
                let item = Item {
                    id: self.next_id.fetch_add(1, Ordering::AcqRel),
                    x,
                    y,
                    kind: Self::weighted_kind(rng),
                };
                state.by_tile.insert((x, y), item.id);
                state.on_ground.insert(item.id, item);
                spawned.push(item);
                break;
            }
        }
        spawned
    }

    /// Attempts a pickup at the player's tile. The item leaves the world
    /// atomically; it only enters the inventory when there is room,
    /// otherwise it stays on the ground.
    pub fn try_pickup(&self, player: PlayerId, x: i32, y: i32) -> Option<Item> {
        let mut state = self.state.lock().expect("item lock poisoned");
        let id = *state.by_tile.get(&(x, y))?;
        let inventory = state.inventories.entry(player).or_default();
        if inventory.len() >= self.inventory_cap {
            return None;
        }
        let item = state.on_ground.remove(&id)?;
        state.by_tile.remove(&(x, y));
        state
            .inventories
            .entry(player)
            .or_default()
            .push(item.kind);
        Some(item)
    }

    /// Removes one instance of the kind from the inventory. USE actions
    /// decrement first and [`Self::restore`] re-enqueues on placement
    /// failure.
    pub fn consume(&self, player: PlayerId, kind: ItemKind) -> bool {
        let mut state = self.state.lock().expect("item lock poisoned");
        let Some(inventory) = state.inventories.get_mut(&player) else {
            return false;
        };
        if let Some(pos) = inventory.iter().position(|k| *k == kind) {
            inventory.remove(pos);
            true
        } else {
            false
        }
    }

    /// Gives an item back after a failed use.
    pub fn restore(&self, player: PlayerId, kind: ItemKind) {
        self.state
            .lock()
            .expect("item lock poisoned")
            .inventories
            .entry(player)
            .or_default()
            .push(kind);
    }

    pub fn inventory(&self, player: PlayerId) -> Vec<ItemKind> {
        self.state
            .lock()
            .expect("item lock poisoned")
            .inventories
            .get(&player)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops a leaving player's inventory.
    pub fn forget_player(&self, player: PlayerId) {
        self.state
            .lock()
            .expect("item lock poisoned")
            .inventories
            .remove(&player);
    }

    /// Ground items currently in the world, for rejoin catch-up.
    pub fn ground_items(&self) -> Vec<Item> {
        self.state
            .lock()
            .expect("item lock poisoned")
            .on_ground
            .values()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn id(n: u128) -> PlayerId {
        PlayerId(n | 1 << 64)
    }

    #[test]
    fn spawned_items_land_on_free_walkable_tiles() {
        let world = world::instantiate(0).unwrap();
        let items = ItemManager::new(3);
        let mut rng = StdRng::seed_from_u64(3);
        let spawned = items.spawn_batch(&world, 10, &mut rng);
        assert_eq!(spawned.len(), 10);
        let mut tiles: Vec<(i32, i32)> = spawned.iter().map(|i| (i.x, i.y)).collect();
        tiles.sort_unstable();
        tiles.dedup();
        assert_eq!(tiles.len(), 10, "no stacking on one tile");
        for item in &spawned {
            assert!(world.is_walkable(item.x, item.y));
        }
    }

    #[test]
    fn pickup_respects_the_inventory_cap() {
        let world = world::instantiate(0).unwrap();
        let items = ItemManager::new(2);
        let mut rng = StdRng::seed_from_u64(4);
        let spawned = items.spawn_batch(&world, 3, &mut rng);
        let player = id(1);
        assert!(items.try_pickup(player, spawned[0].x, spawned[0].y).is_some());
        assert!(items.try_pickup(player, spawned[1].x, spawned[1].y).is_some());
        // Third pickup bounces and the item stays in the world.
        assert!(items.try_pickup(player, spawned[2].x, spawned[2].y).is_none());
        assert_eq!(items.inventory(player).len(), 2);
        assert!(
            items
                .ground_items()
                .iter()
                .any(|i| i.id == spawned[2].id)
        );
    }

    #[test]
    fn consume_then_restore_rolls_back() {
        let items = ItemManager::new(3);
        let player = id(2);
        items.restore(player, ItemKind::Fence);
        assert!(items.consume(player, ItemKind::Fence));
        assert!(!items.consume(player, ItemKind::Fence), "inventory is empty");
        items.restore(player, ItemKind::Fence);
        assert_eq!(items.inventory(player), vec![ItemKind::Fence]);
    }

    #[test]
    fn pickup_only_triggers_on_the_exact_tile() {
        let world = world::instantiate(0).unwrap();
        let items = ItemManager::new(3);
        let mut rng = StdRng::seed_from_u64(5);
        let spawned = items.spawn_batch(&world, 1, &mut rng);
        let item = spawned[0];
        assert!(items.try_pickup(id(3), item.x + 1, item.y).is_none());
        assert!(items.try_pickup(id(3), item.x, item.y).is_some());
    }
}
