//! A game instance: one live match. Owns the world, the per-match player
//! registry, the projectile engine, the item manager and the kill tracker,
//! and runs three periodic tasks (projectile tick, item spawns, time sync)
//! plus one-shot respawn timers.
//!
//! Incoming packets are routed here by the server core once the sender is
//! known to be in this match; outgoing state always carries the
//! server-authoritative fields, never the client's claims.

pub mod bots;
pub mod items;
pub mod kills;
pub mod movement;
pub mod projectile;
pub mod registry;
pub mod spatial;

use crate::characters::{self, CastBehavior};
use crate::clock::now_ms;
use crate::config::ServerConfig;
use crate::game::items::ItemManager;
use crate::game::kills::KillTracker;
use crate::game::movement::MovementValidator;
use crate::game::projectile::{ProjectileEngine, ProjectileEvent, TickContext};
use crate::game::registry::{PlayerRegistry, PlayerState};
use crate::net::{ClientHandle, Outbound};
use crate::store::CredentialStore;
use crate::world::{TILE_FENCE, World};
use protocol::{
    Color, GameEventKind, GameMode, ItemAction, ItemKind, Packet, Payload, PlayerId,
    ProjectileAction,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Damage per burn pulse and the pulse interval.
const BURN_PULSE_DAMAGE: i32 = 1;
const BURN_PULSE_MS: u64 = 500;

/// How long a server-forced position blocks client overwrites.
const TELEPORT_LOCK_MS: u64 = 1_000;

/// Static parameters of a match.
pub struct InstanceSettings {
    pub id: u32,
    pub map_index: u8,
    pub duration_min: u8,
    pub mode: GameMode,
    pub ranked: bool,
}

pub struct GameInstance {
    pub id: u32,
    pub map_index: u8,
    pub duration_min: u8,
    pub mode: GameMode,
    pub ranked: bool,
    pub world: World,
    pub registry: PlayerRegistry,
    pub items: ItemManager,
    pub kills: KillTracker,
    validator: MovementValidator,
    engine: tokio::sync::Mutex<ProjectileEngine>,
    config: Arc<ServerConfig>,
    outbound: Arc<Outbound>,
    store: Arc<CredentialStore>,
    started_at: u64,
    ended: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Serializes spawn-point allocation so simultaneous respawns cannot
    /// land on the same tile.
    respawn_lock: tokio::sync::Mutex<()>,
    finished_tx: mpsc::Sender<u32>,
    /// Back-reference for spawning one-shot tasks from `&self` methods.
    me: Weak<GameInstance>,
}

impl GameInstance {
    pub fn new(
        settings: InstanceSettings,
        world: World,
        config: Arc<ServerConfig>,
        outbound: Arc<Outbound>,
        store: Arc<CredentialStore>,
        finished_tx: mpsc::Sender<u32>,
    ) -> Arc<GameInstance> {
        let validator = MovementValidator::new(config.move_rate_limit_ms, config.shoot_cooldown_ms);
        let items = ItemManager::new(config.inventory_cap);
        Arc::new_cyclic(|me| GameInstance {
            id: settings.id,
            map_index: settings.map_index,
            duration_min: settings.duration_min,
            mode: settings.mode,
            ranked: settings.ranked,
            world,
            registry: PlayerRegistry::new(),
            items,
            kills: KillTracker::new(),
            validator,
            engine: tokio::sync::Mutex::new(ProjectileEngine::new()),
            config,
            outbound,
            store,
            started_at: now_ms(),
            ended: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
            respawn_lock: tokio::sync::Mutex::new(()),
            finished_tx,
            me: me.clone(),
        })
    }

    /// Registers a participant before the instance starts ticking.
    pub fn add_player(&self, player: Arc<PlayerState>) {
        self.kills.track(player.id);
        self.registry.add(player);
    }

    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Seconds until the match is over.
    pub fn remaining_s(&self, now: u64) -> i64 {
        let total = self.duration_min as i64 * 60;
        total - now.saturating_sub(self.started_at) as i64 / 1000
    }

    /// Spawns the three schedulers and, when the roster contains bots, the
    /// bot controller.
    pub fn start(self: &Arc<GameInstance>) {
        let mut tasks = self.tasks.lock().expect("task list poisoned");

        let instance = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                instance.config.projectile_speed_ms,
            ));
            loop {
                interval.tick().await;
                instance.projectile_tick().await;
            }
        }));

        let instance = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                instance.config.item_spawn_interval_ms,
            ));
            loop {
                interval.tick().await;
                instance.item_tick().await;
            }
        }));

        let instance = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                instance.config.time_sync_interval_s,
            ));
            loop {
                interval.tick().await;
                instance.time_tick().await;
            }
        }));

        if self.registry.all().iter().any(|p| p.id.is_bot()) {
            let instance = self.clone();
            tasks.push(tokio::spawn(async move {
                bots::run(instance).await;
            }));
        }

        tracing::info!(instance = self.id, map = self.map_index, "Instance started.");
    }

    /// The authoritative PLAYER_UPDATE payload for one player.
    fn player_update_payload(&self, player: &PlayerState, now: u64) -> Payload {
        let (x, y) = player.position();
        Payload::PlayerUpdate {
            x: x as u16,
            y: y as u16,
            color: player.color,
            health: player.health().max(0) as u16,
            charge: player.charge.load(Ordering::Relaxed),
            effects: player.effects_mask(now),
            character_id: player.character_id,
            team_id: player.team_id,
        }
    }

    /// The PLAYER_JOIN payload describing one participant.
    pub fn player_join_payload(&self, player: &PlayerState) -> Payload {
        let (x, y) = player.position();
        Payload::PlayerJoin {
            x: x as u16,
            y: y as u16,
            color: player.color,
            name: player.name.clone(),
            health: player.health().max(0) as u16,
            max_health: player.max_health as u16,
            character_id: player.character_id,
            team_id: player.team_id,
        }
    }

    async fn broadcast_player_state(&self, player: &PlayerState, now: u64) {
        let payload = self.player_update_payload(player, now);
        self.outbound
            .broadcast(&self.registry.all(), player.id, payload)
            .await;
    }

    fn is_teammate(&self, a: &PlayerState, b: &PlayerState) -> bool {
        self.mode == GameMode::Teams && a.team_id != 0 && a.team_id == b.team_id
    }

    // ---- scheduled ticks ------------------------------------------------

    async fn projectile_tick(&self) {
        if self.has_ended() {
            return;
        }
        let now = now_ms();
        let roster = self.registry.all();
        let players: HashMap<PlayerId, Arc<PlayerState>> =
            roster.iter().map(|p| (p.id, p.clone())).collect();

        self.apply_burn_pulses(&roster, now).await;

        let events = {
            let mut engine = self.engine.lock().await;
            let ctx = TickContext {
                world: &self.world,
                players: &players,
                mode: self.mode,
                now,
            };
            engine.tick(&ctx)
        };

        for event in events {
            self.translate_event(event, &players, now).await;
        }
    }

    /// Damage-over-time for burning players, credited to the igniter.
    async fn apply_burn_pulses(&self, roster: &[Arc<PlayerState>], now: u64) {
        for player in roster {
            if !player.is_burning(now) || !player.is_alive() {
                continue;
            }
            let last = player.last_burn_pulse.load(Ordering::Acquire);
            if now.saturating_sub(last) < BURN_PULSE_MS {
                continue;
            }
            player.last_burn_pulse.store(now, Ordering::Release);
            let (prev, post) = player.apply_damage(BURN_PULSE_DAMAGE);
            if prev <= 0 {
                continue;
            }
            if post <= 0 {
                let source = player.burn_source();
                self.handle_kill(source, player.id, now).await;
            } else {
                self.broadcast_player_state(player, now).await;
            }
        }
    }

    async fn translate_event(
        &self,
        event: ProjectileEvent,
        players: &HashMap<PlayerId, Arc<PlayerState>>,
        now: u64,
    ) {
        let roster = self.registry.all();
        match event {
            ProjectileEvent::Moved {
                id,
                x,
                y,
                dx,
                dy,
                color,
                charge,
                kind,
            } => {
                let payload = Payload::ProjectileUpdate {
                    action: ProjectileAction::Move,
                    x,
                    y,
                    dx,
                    dy,
                    color,
                    id,
                    target: PlayerId::ZERO,
                    charge,
                    kind,
                };
                self.outbound.broadcast(&roster, PlayerId::ZERO, payload).await;
            }
            ProjectileEvent::Hit {
                id,
                owner,
                target,
                damage,
                kind,
                charge,
                x,
                y,
                dx,
                dy,
            } => {
                if let Some(def) = characters::projectile(kind)
                    && let Some(victim) = players.get(&target)
                {
                    self.apply_hit_effects(owner, victim, def, damage, (dx, dy), players, now)
                        .await;
                }
                let payload = Payload::ProjectileUpdate {
                    action: ProjectileAction::Hit,
                    x,
                    y,
                    dx,
                    dy,
                    color: Color::default(),
                    id,
                    target,
                    charge,
                    kind,
                };
                self.outbound.broadcast(&roster, owner, payload).await;
                if let Some(victim) = players.get(&target) {
                    self.broadcast_player_state(victim, now).await;
                }
            }
            ProjectileEvent::Kill {
                id,
                owner,
                target,
                damage,
                kind,
                x,
                y,
                dx,
                dy,
            } => {
                // The finishing blow carries the same on-hit hooks as any
                // other hit; handle_kill clears the victim's state after.
                if let Some(def) = characters::projectile(kind)
                    && let Some(victim) = players.get(&target)
                {
                    self.apply_hit_effects(owner, victim, def, damage, (dx, dy), players, now)
                        .await;
                }
                let payload = Payload::ProjectileUpdate {
                    action: ProjectileAction::Hit,
                    x,
                    y,
                    dx,
                    dy,
                    color: Color::default(),
                    id,
                    target,
                    charge: 0,
                    kind,
                };
                self.outbound.broadcast(&roster, owner, payload).await;
                self.handle_kill(owner, target, now).await;
            }
            ProjectileEvent::AreaEffect { id, x, y, kind, color } => {
                let payload = Payload::ProjectileUpdate {
                    action: ProjectileAction::Hit,
                    x,
                    y,
                    dx: 0.0,
                    dy: 0.0,
                    color,
                    id,
                    target: PlayerId::ZERO,
                    charge: 0,
                    kind,
                };
                self.outbound.broadcast(&roster, PlayerId::ZERO, payload).await;
            }
            ProjectileEvent::AreaHit { target, .. } => {
                if let Some(victim) = players.get(&target) {
                    self.broadcast_player_state(victim, now).await;
                }
            }
            ProjectileEvent::AreaKill { owner, target, .. } => {
                self.handle_kill(owner, target, now).await;
            }
            ProjectileEvent::Despawned { id } => {
                let payload = Payload::ProjectileUpdate {
                    action: ProjectileAction::Despawn,
                    x: 0.0,
                    y: 0.0,
                    dx: 0.0,
                    dy: 0.0,
                    color: Color::default(),
                    id,
                    target: PlayerId::ZERO,
                    charge: 0,
                    kind: 0,
                };
                self.outbound.broadcast(&roster, PlayerId::ZERO, payload).await;
            }
        }
    }

    /// On-hit side effects: freeze, push, pull, teleport-behind, life
    /// steal, ignite. Owner-based effects silently no-op when the owner has
    /// left mid-flight.
    #[allow(clippy::too_many_arguments)]
    async fn apply_hit_effects(
        &self,
        owner_id: PlayerId,
        victim: &Arc<PlayerState>,
        def: &'static characters::ProjectileDef,
        damage: i32,
        velocity: (f32, f32),
        players: &HashMap<PlayerId, Arc<PlayerState>>,
        now: u64,
    ) {
        use characters::OnHitEffect;
        let owner = players.get(&owner_id);
        match def.on_hit {
            OnHitEffect::None => {}
            OnHitEffect::Freeze { ms } => {
                victim.frozen_until.store(now + ms, Ordering::Release);
            }
            OnHitEffect::Push { distance } => {
                let (step_x, step_y) = dominant_direction(velocity);
                let (mut x, mut y) = victim.position();
                for _ in 0..distance {
                    let (nx, ny) = (x + step_x, y + step_y);
                    if !self.world.is_walkable(nx, ny) {
                        break;
                    }
                    x = nx;
                    y = ny;
                }
                victim.set_position(x, y);
                victim
                    .server_teleport_until
                    .store(now + TELEPORT_LOCK_MS, Ordering::Release);
            }
            OnHitEffect::PullToOwner => {
                if let Some(owner) = owner {
                    let (ox, oy) = owner.position();
                    let (vx, vy) = victim.position();
                    let (step_x, step_y) =
                        dominant_direction(((vx - ox) as f32, (vy - oy) as f32));
                    let target = (ox + step_x, oy + step_y);
                    if self.world.is_walkable(target.0, target.1) {
                        victim.set_position(target.0, target.1);
                        victim
                            .server_teleport_until
                            .store(now + TELEPORT_LOCK_MS, Ordering::Release);
                    }
                }
            }
            OnHitEffect::TeleportBehind { distance, freeze_ms } => {
                victim
                    .frozen_until
                    .store(now + freeze_ms, Ordering::Release);
                if let Some(owner) = owner {
                    let (step_x, step_y) = dominant_direction(velocity);
                    let (vx, vy) = victim.position();
                    let behind = (vx + step_x * distance, vy + step_y * distance);
                    if self.world.is_walkable(behind.0, behind.1) {
                        owner.set_position(behind.0, behind.1);
                        owner
                            .server_teleport_until
                            .store(now + TELEPORT_LOCK_MS, Ordering::Release);
                        self.broadcast_player_state(owner, now).await;
                    }
                }
            }
            OnHitEffect::LifeSteal { percent } => {
                if let Some(owner) = owner {
                    owner.heal(damage * percent as i32 / 100);
                    self.broadcast_player_state(owner, now).await;
                }
            }
        }
        if def.ignite_ms > 0 {
            victim.set_burn(now + def.ignite_ms, owner_id);
        }
    }

    /// Kill bookkeeping: counters, effect wipe, broadcasts and the respawn
    /// timer.
    async fn handle_kill(&self, killer: PlayerId, victim_id: PlayerId, now: u64) {
        self.kills.record_kill(killer, victim_id);
        let Some(victim) = self.registry.get(victim_id) else {
            return;
        };
        victim.clear_effects();
        self.broadcast_player_state(&victim, now).await;
        let payload = Payload::GameEvent {
            event: GameEventKind::Kill,
            remaining_s: self.remaining_s(now).max(0) as u32,
            kills: self.kills.kills_of(killer),
            deaths: self.kills.deaths_of(victim_id),
            target: victim_id,
            rank: 0,
            spawn_x: 0,
            spawn_y: 0,
            team_id: victim.team_id,
        };
        self.outbound
            .broadcast(&self.registry.all(), killer, payload)
            .await;
        self.schedule_respawn(victim_id);
    }

    fn schedule_respawn(&self, victim: PlayerId) {
        // One-shot task per respawn; nothing outlives the timer.
        let delay = tokio::time::Duration::from_millis(self.config.respawn_delay_ms);
        let instance = self.self_arc();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            instance.respawn(victim).await;
        });
    }

    async fn respawn(&self, victim: PlayerId) {
        if self.has_ended() {
            return;
        }
        let Some(player) = self.registry.get(victim) else {
            return; // left while dead
        };
        let now = now_ms();
        {
            let _guard = self.respawn_lock.lock().await;
            let occupied: Vec<(i32, i32)> = self
                .registry
                .all()
                .iter()
                .filter(|p| p.id != victim && p.is_alive())
                .map(|p| p.position())
                .collect();
            let spawn = self
                .world
                .pick_spawn(&occupied, &mut rand::thread_rng());
            player.set_position(spawn.0, spawn.1);
        }
        player.restore_health();
        player.clear_effects();
        player
            .server_teleport_until
            .store(now + TELEPORT_LOCK_MS, Ordering::Release);

        let (x, y) = player.position();
        let payload = Payload::GameEvent {
            event: GameEventKind::Respawn,
            remaining_s: self.remaining_s(now).max(0) as u32,
            kills: self.kills.kills_of(victim),
            deaths: self.kills.deaths_of(victim),
            target: victim,
            rank: 0,
            spawn_x: x as u16,
            spawn_y: y as u16,
            team_id: player.team_id,
        };
        let roster = self.registry.all();
        self.outbound.broadcast(&roster, victim, payload).await;
        self.broadcast_player_state(&player, now).await;
    }

    async fn item_tick(&self) {
        if self.has_ended() {
            return;
        }
        let count = (self.world.area() / 2000).clamp(3, 20) as usize;
        let spawned = self
            .items
            .spawn_batch(&self.world, count, &mut rand::thread_rng());
        let roster = self.registry.all();
        for item in spawned {
            let payload = Payload::ItemUpdate {
                action: ItemAction::Spawn,
                x: item.x as u16,
                y: item.y as u16,
                kind: item.kind,
                id: item.id,
            };
            self.outbound.broadcast(&roster, PlayerId::ZERO, payload).await;
        }
    }

    async fn time_tick(&self) {
        if self.has_ended() {
            return;
        }
        let now = now_ms();
        let remaining = self.remaining_s(now);
        let payload = Payload::GameEvent {
            event: GameEventKind::TimeSync,
            remaining_s: remaining.max(0) as u32,
            kills: 0,
            deaths: 0,
            target: PlayerId::ZERO,
            rank: 0,
            spawn_x: 0,
            spawn_y: 0,
            team_id: 0,
        };
        self.outbound
            .broadcast(&self.registry.all(), PlayerId::ZERO, payload)
            .await;
        if remaining <= 0 {
            self.end_game();
        }
    }

    // ---- end of game ----------------------------------------------------

    /// Idempotent; the first caller wins and the finish sequence runs on
    /// its own task so a scheduler can trigger it and still be aborted.
    pub fn end_game(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let instance = self.self_arc();
        tokio::spawn(async move {
            instance.finish().await;
        });
    }

    async fn finish(&self) {
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        let roster = self.registry.all();
        tracing::info!(instance = self.id, "Game over.");

        let payload = Payload::GameEvent {
            event: GameEventKind::GameOver,
            remaining_s: 0,
            kills: 0,
            deaths: 0,
            target: PlayerId::ZERO,
            rank: 0,
            spawn_x: 0,
            spawn_y: 0,
            team_id: 0,
        };
        self.outbound.broadcast(&roster, PlayerId::ZERO, payload).await;

        // Per-player ranks: team standing in Teams mode, scoreboard order
        // in free-for-all.
        let scoreboard = self.kills.scoreboard();
        let mut ranks: HashMap<PlayerId, u16> = HashMap::new();
        if self.mode == GameMode::Teams {
            let teams: HashMap<PlayerId, u8> = roster.iter().map(|p| (p.id, p.team_id)).collect();
            let team_rows = self.kills.team_scoreboard(&teams);
            for row in &scoreboard {
                let team = teams.get(&row.id).copied().unwrap_or(0);
                let rank = team_rows
                    .iter()
                    .find(|t| t.team_id == team)
                    .map(|t| t.rank)
                    .unwrap_or(0);
                ranks.insert(row.id, rank);
            }
        } else {
            for (i, row) in scoreboard.iter().enumerate() {
                ranks.insert(row.id, (i + 1) as u16);
            }
        }

        for row in &scoreboard {
            let team_id = self
                .registry
                .get(row.id)
                .map(|p| p.team_id)
                .unwrap_or(0);
            let payload = Payload::GameEvent {
                event: GameEventKind::ScoreEntry,
                remaining_s: 0,
                kills: row.kills,
                deaths: row.deaths,
                target: row.id,
                rank: ranks.get(&row.id).copied().unwrap_or(0),
                spawn_x: 0,
                spawn_y: 0,
                team_id,
            };
            self.outbound.broadcast(&roster, PlayerId::ZERO, payload).await;
        }
        let payload = Payload::GameEvent {
            event: GameEventKind::ScoreEnd,
            remaining_s: 0,
            kills: 0,
            deaths: 0,
            target: PlayerId::ZERO,
            rank: 0,
            spawn_x: 0,
            spawn_y: 0,
            team_id: 0,
        };
        self.outbound.broadcast(&roster, PlayerId::ZERO, payload).await;

        // Persist with bots filtered out; a failed write rolls back and is
        // not retried.
        let results: Vec<(PlayerId, u32, u32, u16)> = scoreboard
            .iter()
            .filter(|row| !row.id.is_bot())
            .map(|row| {
                (
                    row.id,
                    row.kills,
                    row.deaths,
                    ranks.get(&row.id).copied().unwrap_or(0),
                )
            })
            .collect();
        if !results.is_empty() {
            if let Err(err) = self
                .store
                .save_match(self.map_index, self.duration_min, &results)
                .await
            {
                tracing::error!(instance = self.id, %err, "Match persistence failed.");
            }
        }

        if self.ranked {
            self.apply_elo_updates(&results).await;
        }

        if let Err(err) = self.finished_tx.send(self.id).await {
            tracing::warn!(instance = self.id, ?err, "Finish notification lost.");
        }
    }

    /// FFA Elo over the final ranks: pairwise expectation with
    /// `k = 32 / (N - 1)`.
    async fn apply_elo_updates(&self, results: &[(PlayerId, u32, u32, u16)]) {
        let n = results.len();
        if n < 2 {
            return;
        }
        let mut elos: HashMap<PlayerId, i64> = HashMap::new();
        for (id, ..) in results {
            match self.store.elo(*id).await {
                Ok(elo) => {
                    elos.insert(*id, elo);
                }
                Err(err) => {
                    tracing::error!(player = %id, %err, "ELO read failed.");
                }
            }
        }
        let k = 32.0 / (n as f64 - 1.0);
        for (id, _, _, rank) in results {
            let Some(&elo) = elos.get(id) else { continue };
            let mut delta = 0.0;
            for (other, _, _, other_rank) in results {
                if other == id {
                    continue;
                }
                let Some(&other_elo) = elos.get(other) else {
                    continue;
                };
                let expected = 1.0 / (1.0 + 10f64.powf((other_elo - elo) as f64 / 400.0));
                let actual = if rank < other_rank { 1.0 } else { 0.0 };
                delta += k * (actual - expected);
            }
            let updated = ((elo as f64 + delta).round() as i64).max(0);
            if let Err(err) = self.store.update_elo(*id, updated).await {
                tracing::error!(player = %id, %err, "ELO write failed.");
            }
        }
    }

    // ---- packet routing -------------------------------------------------

    /// Handles one packet from a participant of this match.
    pub async fn handle_packet(&self, packet: Packet) {
        if self.has_ended() {
            return;
        }
        let Some(sender) = self.registry.get(packet.sender) else {
            tracing::debug!(instance = self.id, sender = %packet.sender, "Packet from non-participant dropped.");
            return;
        };
        let now = now_ms();
        match packet.payload {
            Payload::PlayerUpdate { x, y, charge, .. } => {
                self.handle_player_update(&sender, x as i32, y as i32, charge, now)
                    .await;
            }
            Payload::ProjectileUpdate {
                action: ProjectileAction::Spawn,
                x,
                y,
                dx,
                dy,
                color,
                charge,
                kind,
                ..
            } => {
                self.handle_spawn_request(&sender, x, y, dx, dy, color, charge, kind, now)
                    .await;
            }
            Payload::ItemUpdate {
                action: ItemAction::Use,
                x,
                y,
                kind,
                ..
            } => {
                self.handle_item_use(&sender, kind, x as i32, y as i32, now)
                    .await;
            }
            Payload::Heartbeat => {
                self.registry.update_heartbeat(sender.id, now);
            }
            Payload::PlayerLeave => {
                self.remove_player(sender.id).await;
            }
            other => {
                tracing::debug!(
                    instance = self.id,
                    packet = ?other.packet_type(),
                    "Unroutable in-game packet dropped."
                );
            }
        }
    }

    async fn handle_player_update(
        &self,
        sender: &Arc<PlayerState>,
        x: i32,
        y: i32,
        charge: u8,
        now: u64,
    ) {
        if !sender.is_alive() {
            return;
        }
        sender.charge.store(charge, Ordering::Relaxed);
        match self.validator.validate_move(sender, &self.world, x, y, now) {
            Ok(()) => {
                if let Some(item) = self.items.try_pickup(sender.id, x, y) {
                    let payload = Payload::ItemUpdate {
                        action: ItemAction::Pickup,
                        x: item.x as u16,
                        y: item.y as u16,
                        kind: item.kind,
                        id: item.id,
                    };
                    self.outbound
                        .broadcast(&self.registry.all(), sender.id, payload)
                        .await;
                }
                self.broadcast_player_state(sender, now).await;
            }
            Err(reject) => {
                tracing::warn!(
                    instance = self.id,
                    player = %sender.id,
                    ?reject,
                    claimed = ?(x, y),
                    "Movement rejected."
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_spawn_request(
        &self,
        sender: &Arc<PlayerState>,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
        color: Color,
        charge: u8,
        kind: u8,
        now: u64,
    ) {
        if !sender.is_alive() {
            return;
        }
        let approval = match self
            .validator
            .validate_spawn(sender, kind, x, y, dx, dy, now)
        {
            Ok(approval) => approval,
            Err(reject) => {
                tracing::warn!(
                    instance = self.id,
                    player = %sender.id,
                    ?reject,
                    kind,
                    "Projectile spawn rejected."
                );
                return;
            }
        };

        match approval.behavior {
            CastBehavior::Standard => {
                self.spawn_and_announce(sender.id, x, y, dx, dy, color, charge, kind)
                    .await;
            }
            CastBehavior::Fan { count, spread } => {
                let count = count.max(1);
                for i in 0..count {
                    let angle = if count == 1 {
                        0.0
                    } else {
                        -spread / 2.0 + spread * i as f32 / (count - 1) as f32
                    };
                    let (fdx, fdy) = rotate(dx, dy, angle);
                    self.spawn_and_announce(sender.id, x, y, fdx, fdy, color, charge, kind)
                        .await;
                }
            }
            CastBehavior::GroundSlam { radius } => {
                self.ground_slam(sender, approval.def, radius, now).await;
            }
            CastBehavior::PhaseShift { duration_ms } => {
                sender
                    .phased_until
                    .store(now + duration_ms, Ordering::Release);
                self.broadcast_player_state(sender, now).await;
            }
            CastBehavior::Dash {
                duration_ms,
                ..
            } => {
                sender.speed_until.store(now + duration_ms, Ordering::Release);
                self.broadcast_player_state(sender, now).await;
            }
            CastBehavior::Teleport { .. } => {
                // Teleports arrive as movement, never as a spawn request.
            }
        }
    }

    async fn spawn_and_announce(
        &self,
        owner: PlayerId,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
        color: Color,
        charge: u8,
        kind: u8,
    ) {
        let spawned = {
            let mut engine = self.engine.lock().await;
            engine.spawn(owner, x, y, dx, dy, color, charge, kind)
        };
        let Some(snapshot) = spawned else {
            tracing::warn!(instance = self.id, player = %owner, "Projectile cap reached.");
            return;
        };
        let payload = Payload::ProjectileUpdate {
            action: ProjectileAction::Spawn,
            x: snapshot.x,
            y: snapshot.y,
            dx: snapshot.dx,
            dy: snapshot.dy,
            color: snapshot.color,
            id: snapshot.id,
            target: PlayerId::ZERO,
            charge: snapshot.charge,
            kind: snapshot.kind,
        };
        self.outbound
            .broadcast(&self.registry.all(), owner, payload)
            .await;
    }

    /// Instant radial damage around the caster.
    async fn ground_slam(
        &self,
        caster: &Arc<PlayerState>,
        def: &'static characters::ProjectileDef,
        radius: f32,
        now: u64,
    ) {
        let (cx, cy) = caster.position();
        let center = (cx as f32 + 0.5, cy as f32 + 0.5);
        let payload = Payload::ProjectileUpdate {
            action: ProjectileAction::Hit,
            x: center.0,
            y: center.1,
            dx: 0.0,
            dy: 0.0,
            color: caster.color,
            id: 0,
            target: PlayerId::ZERO,
            charge: 0,
            kind: def.id,
        };
        self.outbound
            .broadcast(&self.registry.all(), caster.id, payload)
            .await;

        for player in self.registry.all() {
            if player.id == caster.id
                || !player.is_hittable(now)
                || self.is_teammate(caster, &player)
            {
                continue;
            }
            let (px, py) = player.position();
            let dx = px as f32 + 0.5 - center.0;
            let dy = py as f32 + 0.5 - center.1;
            if (dx * dx + dy * dy).sqrt() > radius {
                continue;
            }
            let (prev, post) = player.apply_damage(def.base_damage);
            if prev <= 0 {
                continue;
            }
            if post <= 0 {
                self.handle_kill(caster.id, player.id, now).await;
            } else {
                self.broadcast_player_state(&player, now).await;
            }
        }
    }

    async fn handle_item_use(
        &self,
        sender: &Arc<PlayerState>,
        kind: ItemKind,
        target_x: i32,
        target_y: i32,
        now: u64,
    ) {
        if !self.items.consume(sender.id, kind) {
            tracing::debug!(instance = self.id, player = %sender.id, ?kind, "Use without item.");
            return;
        }
        let roster = self.registry.all();
        let announce_use = Payload::ItemUpdate {
            action: ItemAction::Use,
            x: target_x as u16,
            y: target_y as u16,
            kind,
            id: 0,
        };
        match kind {
            ItemKind::Heart => {
                sender.restore_health();
                self.outbound.broadcast(&roster, sender.id, announce_use).await;
                self.broadcast_player_state(sender, now).await;
            }
            ItemKind::Shield => {
                sender
                    .shield_until
                    .store(now + self.config.shield_duration_ms, Ordering::Release);
                self.outbound.broadcast(&roster, sender.id, announce_use).await;
                self.broadcast_player_state(sender, now).await;
            }
            ItemKind::Gem => {
                sender
                    .gem_until
                    .store(now + self.config.gem_duration_ms, Ordering::Release);
                self.outbound.broadcast(&roster, sender.id, announce_use).await;
                self.broadcast_player_state(sender, now).await;
            }
            ItemKind::Star => {
                if self.world.is_walkable(target_x, target_y) {
                    sender.set_position(target_x, target_y);
                    // The client initiated this jump and will claim the new
                    // tile next update; wave the speed gate through once
                    // instead of locking the position.
                    sender.teleport_waiver.store(true, Ordering::Release);
                    self.outbound.broadcast(&roster, sender.id, announce_use).await;
                    self.broadcast_player_state(sender, now).await;
                } else {
                    self.refund_item(sender, kind).await;
                }
            }
            ItemKind::Fence => {
                let placed = self.place_fence(sender, target_x, target_y).await;
                if placed {
                    self.outbound.broadcast(&roster, sender.id, announce_use).await;
                } else {
                    self.refund_item(sender, kind).await;
                }
            }
        }
    }

    /// Rolls the inventory slot back and tells the client.
    async fn refund_item(&self, player: &Arc<PlayerState>, kind: ItemKind) {
        self.items.restore(player.id, kind);
        let payload = Payload::ItemUpdate {
            action: ItemAction::Inventory,
            x: 0,
            y: 0,
            kind,
            id: 0,
        };
        self.outbound.send_to_player(player, player.id, payload).await;
    }

    /// Places up to three fence tiles centered on the target tile,
    /// perpendicular to the player's facing axis. Success means at least
    /// one tile landed.
    async fn place_fence(&self, sender: &Arc<PlayerState>, x: i32, y: i32) -> bool {
        let horizontal_facing = sender.facing().is_horizontal();
        let tiles: [(i32, i32); 3] = if horizontal_facing {
            [(x, y - 1), (x, y), (x, y + 1)]
        } else {
            [(x - 1, y), (x, y), (x + 1, y)]
        };
        let occupied: Vec<(i32, i32)> = self.registry.all().iter().map(|p| p.position()).collect();
        let mut placed = false;
        for (tx, ty) in tiles {
            if !self.world.is_walkable(tx, ty) || occupied.contains(&(tx, ty)) {
                continue;
            }
            self.world.set_tile(tx, ty, TILE_FENCE);
            placed = true;
            let payload = Payload::TileUpdate {
                x: tx as u16,
                y: ty as u16,
                tile: TILE_FENCE,
            };
            self.outbound
                .broadcast(&self.registry.all(), sender.id, payload)
                .await;
        }
        placed
    }

    // ---- membership -----------------------------------------------------

    /// Re-admits a participant after a reconnect: rebinds the reliable
    /// channel, optionally accepts the client-remembered position, then
    /// replays world, roster and ground items to the rejoiner only.
    pub async fn rejoin(
        &self,
        id: PlayerId,
        claimed: Option<(i32, i32)>,
        handle: ClientHandle,
    ) -> bool {
        let Some(player) = self.registry.get(id) else {
            return false;
        };
        player.bind_reliable(handle);
        player.last_heartbeat.store(now_ms(), Ordering::Release);
        if let Some((x, y)) = claimed
            && self.world.is_walkable(x, y)
        {
            player.set_position(x, y);
        }

        let payload = Payload::WorldInfo {
            filename: self.world.filename().to_string(),
        };
        self.outbound.send_to_player(&player, PlayerId::ZERO, payload).await;
        for other in self.registry.all() {
            let join = self.player_join_payload(&other);
            self.outbound.send_to_player(&player, other.id, join).await;
        }
        for item in self.items.ground_items() {
            let payload = Payload::ItemUpdate {
                action: ItemAction::Spawn,
                x: item.x as u16,
                y: item.y as u16,
                kind: item.kind,
                id: item.id,
            };
            self.outbound.send_to_player(&player, PlayerId::ZERO, payload).await;
        }
        tracing::info!(instance = self.id, player = %id, "Player rejoined.");
        true
    }

    /// Removes a participant and announces the departure. Their
    /// projectiles keep flying.
    pub async fn remove_player(&self, id: PlayerId) {
        let Some(_player) = self.registry.remove(id) else {
            return;
        };
        self.items.forget_player(id);
        self.outbound
            .broadcast(&self.registry.all(), id, Payload::PlayerLeave)
            .await;
        tracing::info!(instance = self.id, player = %id, "Player left the match.");
    }

    fn self_arc(&self) -> Arc<GameInstance> {
        self.me.upgrade().expect("instance dropped while in use")
    }
}

/// Reduces a float direction to a unit tile step along the dominant axis.
fn dominant_direction(v: (f32, f32)) -> (i32, i32) {
    if v.0.abs() >= v.1.abs() {
        (if v.0 >= 0.0 { 1 } else { -1 }, 0)
    } else {
        (0, if v.1 >= 0.0 { 1 } else { -1 })
    }
}

/// Rotates a velocity vector by `angle` radians.
fn rotate(dx: f32, dy: f32, angle: f32) -> (f32, f32) {
    let (sin, cos) = angle.sin_cos();
    (dx * cos - dy * sin, dx * sin + dy * cos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characters::PROJ_BOLT;
    use crate::store::CredentialStore;
    use crate::world;
    use tokio::net::UdpSocket;

    fn id(n: u128) -> PlayerId {
        PlayerId(n | 1 << 64)
    }

    async fn test_instance(mode: GameMode) -> (Arc<GameInstance>, mpsc::Receiver<u32>) {
        let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind test socket");
        let outbound = Arc::new(Outbound::new(Arc::new(udp)));
        let store = Arc::new(CredentialStore::open_in_memory().await.expect("open store"));
        let (finished_tx, finished_rx) = mpsc::channel(4);
        let instance = GameInstance::new(
            InstanceSettings {
                id: 1,
                map_index: 1,
                duration_min: 1,
                mode,
                ranked: false,
            },
            world::instantiate(1).expect("map"),
            Arc::new(ServerConfig::default()),
            outbound,
            store,
            finished_tx,
        );
        (instance, finished_rx)
    }

    fn join(instance: &GameInstance, n: u128, x: i32, y: i32, team: u8) -> Arc<PlayerState> {
        let player = Arc::new(PlayerState::new(
            id(n),
            format!("p{n}"),
            Color::default(),
            0,
            team,
            (x, y),
        ));
        instance.add_player(player.clone());
        player
    }

    fn packet(sender: PlayerId, payload: Payload) -> Packet {
        Packet {
            sequence: 1,
            sender,
            timestamp: 0,
            payload,
        }
    }

    #[tokio::test]
    async fn projectile_spawn_flies_and_kills_with_respawn() {
        let (instance, _rx) = test_instance(GameMode::Ffa).await;
        let shooter = join(&instance, 1, 5, 5, 0);
        let victim = join(&instance, 2, 5, 7, 0);
        victim.apply_damage(victim.max_health - 5); // one bolt from death

        instance
            .handle_packet(packet(
                shooter.id,
                Payload::ProjectileUpdate {
                    action: ProjectileAction::Spawn,
                    x: 5.0,
                    y: 5.0,
                    dx: 0.0,
                    dy: 1.0,
                    color: Color::default(),
                    id: 0,
                    target: PlayerId::ZERO,
                    charge: 0,
                    kind: PROJ_BOLT,
                },
            ))
            .await;
        for _ in 0..10 {
            instance.projectile_tick().await;
        }

        assert!(victim.health() <= 0, "victim went down");
        assert_eq!(instance.kills.kills_of(shooter.id), 1);
        assert_eq!(instance.kills.deaths_of(victim.id), 1);

        // Drive the respawn directly instead of waiting the delay out.
        instance.respawn(victim.id).await;
        assert_eq!(victim.health(), victim.max_health);
        let (x, y) = victim.position();
        assert!(instance.world.is_walkable(x, y));
    }

    #[tokio::test]
    async fn speed_hack_claim_leaves_the_authoritative_position() {
        let (instance, _rx) = test_instance(GameMode::Ffa).await;
        let player = join(&instance, 1, 5, 5, 0);
        player
            .last_move
            .store(now_ms().saturating_sub(50), Ordering::Release);

        instance
            .handle_packet(packet(
                player.id,
                Payload::PlayerUpdate {
                    x: 40,
                    y: 40,
                    color: Color::default(),
                    health: 100,
                    charge: 0,
                    effects: 0,
                    character_id: 0,
                    team_id: 0,
                },
            ))
            .await;
        assert_eq!(player.position(), (5, 5));
    }

    #[tokio::test]
    async fn client_health_claims_are_ignored_on_accepted_moves() {
        let (instance, _rx) = test_instance(GameMode::Ffa).await;
        let player = join(&instance, 1, 5, 5, 0);
        instance
            .handle_packet(packet(
                player.id,
                Payload::PlayerUpdate {
                    x: 6,
                    y: 5,
                    color: Color::default(),
                    health: 9999,
                    charge: 30,
                    effects: 0xFF,
                    character_id: 0,
                    team_id: 0,
                },
            ))
            .await;
        assert_eq!(player.position(), (6, 5), "move itself is fine");
        assert_eq!(player.health(), player.max_health, "health claim ignored");
        assert_eq!(player.effects_mask(now_ms()), 0, "effect claims ignored");
    }

    #[tokio::test]
    async fn fence_into_a_wall_rolls_the_inventory_back() {
        let (instance, _rx) = test_instance(GameMode::Ffa).await;
        let player = join(&instance, 1, 2, 2, 0);
        instance.items.restore(player.id, ItemKind::Fence);

        // Default facing is down, so the fence row is horizontal; target
        // the border wall row where nothing is placeable.
        instance
            .handle_packet(packet(
                player.id,
                Payload::ItemUpdate {
                    action: ItemAction::Use,
                    x: 1,
                    y: 0,
                    kind: ItemKind::Fence,
                    id: 0,
                },
            ))
            .await;

        assert_eq!(
            instance.items.inventory(player.id),
            vec![ItemKind::Fence],
            "slot restored after failed placement"
        );
        for x in 0..3 {
            assert!(!instance.world.is_fence(x, 0));
        }

        // A walkable target does place and consumes the slot.
        instance
            .handle_packet(packet(
                player.id,
                Payload::ItemUpdate {
                    action: ItemAction::Use,
                    x: 5,
                    y: 5,
                    kind: ItemKind::Fence,
                    id: 0,
                },
            ))
            .await;
        assert!(instance.items.inventory(player.id).is_empty());
        assert!(instance.world.is_fence(5, 5));
    }

    #[tokio::test]
    async fn star_teleports_and_waives_the_next_jump() {
        let (instance, _rx) = test_instance(GameMode::Ffa).await;
        let player = join(&instance, 1, 2, 2, 0);
        instance.items.restore(player.id, ItemKind::Star);

        instance
            .handle_packet(packet(
                player.id,
                Payload::ItemUpdate {
                    action: ItemAction::Use,
                    x: 10,
                    y: 10,
                    kind: ItemKind::Star,
                    id: 0,
                },
            ))
            .await;
        assert_eq!(player.position(), (10, 10));
        assert!(player.teleport_waiver.load(Ordering::Acquire));

        // A star aimed into the keep wall refunds instead.
        instance.items.restore(player.id, ItemKind::Star);
        instance
            .handle_packet(packet(
                player.id,
                Payload::ItemUpdate {
                    action: ItemAction::Use,
                    x: 0,
                    y: 0,
                    kind: ItemKind::Star,
                    id: 0,
                },
            ))
            .await;
        assert_eq!(player.position(), (10, 10));
        assert_eq!(instance.items.inventory(player.id), vec![ItemKind::Star]);
    }

    #[tokio::test]
    async fn ended_instances_ignore_packets_and_report_back() {
        let (instance, mut finished_rx) = test_instance(GameMode::Ffa).await;
        let player = join(&instance, 1, 5, 5, 0);
        instance.end_game();
        assert_eq!(finished_rx.recv().await, Some(1), "finish notification");

        instance
            .handle_packet(packet(
                player.id,
                Payload::PlayerUpdate {
                    x: 6,
                    y: 5,
                    color: Color::default(),
                    health: 100,
                    charge: 0,
                    effects: 0,
                    character_id: 0,
                    team_id: 0,
                },
            ))
            .await;
        assert_eq!(player.position(), (5, 5), "post-game packets are inert");
        assert!(instance.has_ended());
    }

    #[tokio::test]
    async fn life_steal_heals_the_owner_on_a_killing_blow() {
        let (instance, _rx) = test_instance(GameMode::Ffa).await;
        let shooter = {
            let player = Arc::new(PlayerState::new(
                id(1),
                "reaper".into(),
                Color::default(),
                3, // reaper: leech dart primary
                0,
                (5, 5),
            ));
            instance.add_player(player.clone());
            player
        };
        let victim = join(&instance, 2, 5, 7, 0);
        shooter.apply_damage(30);
        victim.apply_damage(victim.max_health - 5); // the dart finishes it

        instance
            .handle_packet(packet(
                shooter.id,
                Payload::ProjectileUpdate {
                    action: ProjectileAction::Spawn,
                    x: 5.0,
                    y: 5.0,
                    dx: 0.0,
                    dy: 1.0,
                    color: Color::default(),
                    id: 0,
                    target: PlayerId::ZERO,
                    charge: 0,
                    kind: crate::characters::PROJ_LEECH_DART,
                },
            ))
            .await;
        for _ in 0..10 {
            instance.projectile_tick().await;
        }

        assert!(victim.health() <= 0);
        assert_eq!(instance.kills.kills_of(shooter.id), 1);
        // 50% of the dart's 9 damage flows back even though the hit killed.
        assert_eq!(shooter.health(), shooter.max_health - 30 + 4);
    }

    #[tokio::test]
    async fn teams_mode_ground_slam_spares_teammates() {
        let (instance, _rx) = test_instance(GameMode::Teams).await;
        let caster = {
            let player = Arc::new(PlayerState::new(
                id(1),
                "warden".into(),
                Color::default(),
                1, // warden: ground slam on Q
                1,
                (5, 5),
            ));
            instance.add_player(player.clone());
            player
        };
        let friend = join(&instance, 2, 6, 5, 1);
        let enemy = join(&instance, 3, 5, 6, 2);

        instance
            .handle_packet(packet(
                caster.id,
                Payload::ProjectileUpdate {
                    action: ProjectileAction::Spawn,
                    x: 5.0,
                    y: 5.0,
                    dx: 0.0,
                    dy: 1.0,
                    color: Color::default(),
                    id: 0,
                    target: PlayerId::ZERO,
                    charge: 0,
                    kind: crate::characters::PROJ_SLAM_WAVE,
                },
            ))
            .await;

        assert_eq!(friend.health(), friend.max_health);
        assert!(enemy.health() < enemy.max_health);
    }
}
