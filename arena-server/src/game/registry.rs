//! The in-memory player directory. One registry exists at the global level
//! for every authenticated connection, and each game instance owns another
//! for its participants.
//!
//! Status effects are absolute millisecond deadlines in atomics: readers
//! compare against the current time and never take a lock. Health is an
//! atomic too, so concurrent hits serialize on the fetch-and-subtract
//! instead of a per-player mutex.

use crate::characters;
use crate::clock::now_ms;
use crate::net::ClientHandle;
use protocol::{
    Color, EFFECT_BURNING, EFFECT_FROZEN, EFFECT_GEM, EFFECT_PHASED, EFFECT_ROOTED, EFFECT_SHIELD,
    EFFECT_SLOWED, EFFECT_SPEED, PlayerId,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Cardinal facing, derived from the last accepted movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Facing {
    Up,
    Down,
    Left,
    Right,
}

impl Facing {
    fn from_u8(raw: u8) -> Facing {
        match raw {
            0 => Facing::Up,
            1 => Facing::Down,
            2 => Facing::Left,
            _ => Facing::Right,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Facing::Up => 0,
            Facing::Down => 1,
            Facing::Left => 2,
            Facing::Right => 3,
        }
    }

    /// True when the facing runs along the x axis.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Facing::Left | Facing::Right)
    }
}

/// Transport bindings of one player. Snapshotted per send so a rebind never
/// races an outgoing broadcast.
#[derive(Default, Clone)]
pub struct Bindings {
    pub reliable: Option<ClientHandle>,
    pub unreliable: Option<SocketAddr>,
}

/// Mutable state of one participant.
pub struct PlayerState {
    pub id: PlayerId,
    pub name: String,
    pub color: Color,
    pub character_id: u8,
    pub team_id: u8,
    pub max_health: i32,

    health: AtomicI32,
    position: Mutex<(i32, i32)>,
    facing: AtomicU8,
    /// Last charge level the client reported, echoed in rebroadcasts.
    pub charge: AtomicU8,

    // Status-effect deadlines, wall-clock milliseconds.
    pub shield_until: AtomicU64,
    pub gem_until: AtomicU64,
    pub frozen_until: AtomicU64,
    pub phased_until: AtomicU64,
    pub burning_until: AtomicU64,
    pub speed_until: AtomicU64,
    pub rooted_until: AtomicU64,
    pub slowed_until: AtomicU64,
    /// While set, incoming position updates cannot overwrite the position a
    /// server-side teleport just assigned.
    pub server_teleport_until: AtomicU64,

    /// Who set the current burn, for kill credit.
    burn_source: Mutex<PlayerId>,
    /// Last burn damage pulse, driven by the projectile tick.
    pub last_burn_pulse: AtomicU64,

    pub last_heartbeat: AtomicU64,
    /// Movement validator bookkeeping.
    pub last_move: AtomicU64,
    pub last_primary_fire: AtomicU64,
    pub last_q_cast: AtomicU64,
    pub last_e_cast: AtomicU64,
    /// One-shot waiver for the position jump following a star teleport.
    pub teleport_waiver: AtomicBool,
    /// Sequence of the newest unreliable packet seen from this player.
    pub last_unreliable_seq: AtomicU32,

    bindings: Mutex<Bindings>,
}

impl PlayerState {
    /// Creates a player at a spawn position. Max health comes from the
    /// character table; unknown ids fall back to 100.
    pub fn new(
        id: PlayerId,
        name: String,
        color: Color,
        character_id: u8,
        team_id: u8,
        spawn: (i32, i32),
    ) -> PlayerState {
        let max_health = characters::character(character_id)
            .map(|c| c.max_health)
            .unwrap_or(100);
        let now = now_ms();
        PlayerState {
            id,
            name,
            color,
            character_id,
            team_id,
            max_health,
            health: AtomicI32::new(max_health),
            position: Mutex::new(spawn),
            facing: AtomicU8::new(Facing::Down.as_u8()),
            charge: AtomicU8::new(0),
            shield_until: AtomicU64::new(0),
            gem_until: AtomicU64::new(0),
            frozen_until: AtomicU64::new(0),
            phased_until: AtomicU64::new(0),
            burning_until: AtomicU64::new(0),
            speed_until: AtomicU64::new(0),
            rooted_until: AtomicU64::new(0),
            slowed_until: AtomicU64::new(0),
            server_teleport_until: AtomicU64::new(0),
            burn_source: Mutex::new(PlayerId::ZERO),
            last_burn_pulse: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(now),
            last_move: AtomicU64::new(now),
            last_primary_fire: AtomicU64::new(0),
            last_q_cast: AtomicU64::new(0),
            last_e_cast: AtomicU64::new(0),
            teleport_waiver: AtomicBool::new(false),
            last_unreliable_seq: AtomicU32::new(0),
            bindings: Mutex::new(Bindings::default()),
        }
    }

    pub fn health(&self) -> i32 {
        self.health.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.health() > 0
    }

    /// Applies damage and reports `(previous, after)` health. The caller
    /// decides whether the decrement was a hit, a kill, or a no-op on an
    /// already dead player.
    pub fn apply_damage(&self, damage: i32) -> (i32, i32) {
        let prev = self.health.fetch_sub(damage, Ordering::AcqRel);
        (prev, prev - damage)
    }

    /// Heals without exceeding max health. No effect on dead players.
    pub fn heal(&self, amount: i32) {
        let _ = self
            .health
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
                if h <= 0 {
                    None
                } else {
                    Some((h + amount).min(self.max_health))
                }
            });
    }

    /// Resets health to max, for respawns.
    pub fn restore_health(&self) {
        self.health.store(self.max_health, Ordering::Release);
    }

    pub fn position(&self) -> (i32, i32) {
        *self.position.lock().expect("position lock poisoned")
    }

    pub fn set_position(&self, x: i32, y: i32) {
        *self.position.lock().expect("position lock poisoned") = (x, y);
    }

    pub fn facing(&self) -> Facing {
        Facing::from_u8(self.facing.load(Ordering::Relaxed))
    }

    pub fn set_facing(&self, facing: Facing) {
        self.facing.store(facing.as_u8(), Ordering::Relaxed);
    }

    fn active(deadline: &AtomicU64, now: u64) -> bool {
        deadline.load(Ordering::Acquire) > now
    }

    pub fn is_shielded(&self, now: u64) -> bool {
        Self::active(&self.shield_until, now)
    }

    pub fn has_gem_boost(&self, now: u64) -> bool {
        Self::active(&self.gem_until, now)
    }

    pub fn is_frozen(&self, now: u64) -> bool {
        Self::active(&self.frozen_until, now)
    }

    pub fn is_phased(&self, now: u64) -> bool {
        Self::active(&self.phased_until, now)
    }

    pub fn is_burning(&self, now: u64) -> bool {
        Self::active(&self.burning_until, now)
    }

    pub fn is_rooted(&self, now: u64) -> bool {
        Self::active(&self.rooted_until, now)
    }

    pub fn has_speed_boost(&self, now: u64) -> bool {
        Self::active(&self.speed_until, now)
    }

    /// Candidate set membership for the projectile tick: alive, unshielded,
    /// not phased.
    pub fn is_hittable(&self, now: u64) -> bool {
        self.is_alive() && !self.is_shielded(now) && !self.is_phased(now)
    }

    /// The effect bitmask broadcast in PLAYER_UPDATE packets.
    pub fn effects_mask(&self, now: u64) -> u8 {
        let mut mask = 0;
        if self.is_shielded(now) {
            mask |= EFFECT_SHIELD;
        }
        if self.has_gem_boost(now) {
            mask |= EFFECT_GEM;
        }
        if self.is_frozen(now) {
            mask |= EFFECT_FROZEN;
        }
        if self.is_phased(now) {
            mask |= EFFECT_PHASED;
        }
        if self.is_burning(now) {
            mask |= EFFECT_BURNING;
        }
        if self.has_speed_boost(now) {
            mask |= EFFECT_SPEED;
        }
        if self.is_rooted(now) {
            mask |= EFFECT_ROOTED;
        }
        if Self::active(&self.slowed_until, now) {
            mask |= EFFECT_SLOWED;
        }
        mask
    }

    pub fn set_burn(&self, until: u64, source: PlayerId) {
        self.burning_until.store(until, Ordering::Release);
        *self.burn_source.lock().expect("burn source lock poisoned") = source;
    }

    pub fn burn_source(&self) -> PlayerId {
        *self.burn_source.lock().expect("burn source lock poisoned")
    }

    /// Death and respawn clear every transient effect.
    pub fn clear_effects(&self) {
        for deadline in [
            &self.shield_until,
            &self.gem_until,
            &self.frozen_until,
            &self.phased_until,
            &self.burning_until,
            &self.speed_until,
            &self.rooted_until,
            &self.slowed_until,
            &self.server_teleport_until,
        ] {
            deadline.store(0, Ordering::Release);
        }
        self.teleport_waiver.store(false, Ordering::Release);
    }

    pub fn bindings(&self) -> Bindings {
        self.bindings.lock().expect("bindings lock poisoned").clone()
    }

    pub fn bind_reliable(&self, handle: ClientHandle) {
        self.bindings
            .lock()
            .expect("bindings lock poisoned")
            .reliable = Some(handle);
    }

    pub fn bind_unreliable(&self, addr: SocketAddr) {
        self.bindings
            .lock()
            .expect("bindings lock poisoned")
            .unreliable = Some(addr);
    }

    /// The connection id of the bound reliable channel, if any.
    pub fn reliable_conn(&self) -> Option<u64> {
        self.bindings
            .lock()
            .expect("bindings lock poisoned")
            .reliable
            .as_ref()
            .map(|h| h.conn_id)
    }
}

/// Concurrent directory of players keyed by identity.
#[derive(Default)]
pub struct PlayerRegistry {
    players: RwLock<HashMap<PlayerId, std::sync::Arc<PlayerState>>>,
}

impl PlayerRegistry {
    pub fn new() -> PlayerRegistry {
        PlayerRegistry::default()
    }

    pub fn add(&self, player: std::sync::Arc<PlayerState>) {
        self.players
            .write()
            .expect("registry lock poisoned")
            .insert(player.id, player);
    }

    pub fn remove(&self, id: PlayerId) -> Option<std::sync::Arc<PlayerState>> {
        self.players
            .write()
            .expect("registry lock poisoned")
            .remove(&id)
    }

    pub fn get(&self, id: PlayerId) -> Option<std::sync::Arc<PlayerState>> {
        self.players
            .read()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.players
            .read()
            .expect("registry lock poisoned")
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.players.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every player, in no particular order.
    pub fn all(&self) -> Vec<std::sync::Arc<PlayerState>> {
        self.players
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Finds the player bound to a reliable connection, for disconnects.
    pub fn get_by_conn(&self, conn_id: u64) -> Option<std::sync::Arc<PlayerState>> {
        self.players
            .read()
            .expect("registry lock poisoned")
            .values()
            .find(|p| p.reliable_conn() == Some(conn_id))
            .cloned()
    }

    /// Identities whose last heartbeat is older than the timeout. Bots never
    /// time out; nothing drives their heartbeat.
    pub fn timed_out(&self, now: u64, timeout_ms: u64) -> Vec<PlayerId> {
        self.players
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|p| {
                !p.id.is_bot() && now.saturating_sub(p.last_heartbeat.load(Ordering::Acquire)) > timeout_ms
            })
            .map(|p| p.id)
            .collect()
    }

    pub fn update_heartbeat(&self, id: PlayerId, now: u64) {
        if let Some(player) = self.get(id) {
            player.last_heartbeat.store(now, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn player(id: u128) -> Arc<PlayerState> {
        Arc::new(PlayerState::new(
            PlayerId(id),
            format!("p{id}"),
            Color::new(1, 2, 3),
            0,
            0,
            (5, 5),
        ))
    }

    #[test]
    fn damage_crosses_zero_exactly_once() {
        let p = player(1 << 64);
        let (prev, post) = p.apply_damage(60);
        assert!(prev > 0 && post > 0);
        let (prev, post) = p.apply_damage(60);
        assert!(prev > 0 && post <= 0, "this decrement is the kill");
        let (prev, _) = p.apply_damage(60);
        assert!(prev <= 0, "dead players take no further kills");
    }

    #[test]
    fn heal_never_exceeds_max_and_skips_the_dead() {
        let p = player(1 << 64);
        p.apply_damage(30);
        p.heal(500);
        assert_eq!(p.health(), p.max_health);
        p.apply_damage(p.max_health + 10);
        p.heal(50);
        assert!(p.health() <= 0);
    }

    #[test]
    fn effect_deadlines_expire_without_writes() {
        let p = player(1 << 64);
        let now = now_ms();
        p.frozen_until.store(now + 50, Ordering::Release);
        assert!(p.is_frozen(now));
        assert!(!p.is_frozen(now + 51));
        assert_eq!(p.effects_mask(now) & EFFECT_FROZEN, EFFECT_FROZEN);
        assert_eq!(p.effects_mask(now + 51), 0);
    }

    #[test]
    fn hittable_excludes_shielded_and_phased() {
        let p = player(1 << 64);
        let now = now_ms();
        assert!(p.is_hittable(now));
        p.shield_until.store(now + 1000, Ordering::Release);
        assert!(!p.is_hittable(now));
        p.shield_until.store(0, Ordering::Release);
        p.phased_until.store(now + 1000, Ordering::Release);
        assert!(!p.is_hittable(now));
    }

    #[test]
    fn timed_out_skips_bots() {
        let registry = PlayerRegistry::new();
        let human = player(9 << 64);
        let bot = Arc::new(PlayerState::new(
            PlayerId::bot(1),
            "bot".into(),
            Color::default(),
            0,
            0,
            (1, 1),
        ));
        let stale = now_ms().saturating_sub(60_000);
        human.last_heartbeat.store(stale, Ordering::Release);
        bot.last_heartbeat.store(stale, Ordering::Release);
        registry.add(human.clone());
        registry.add(bot);
        let expired = registry.timed_out(now_ms(), 15_000);
        assert_eq!(expired, vec![human.id]);
    }
}
