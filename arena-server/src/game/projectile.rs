//! The projectile engine. Owns every live projectile of an instance, steps
//! them once per scheduled tick with sub-cell resolution and emits a typed
//! event list the instance translates into broadcasts.
//!
//! Each sub-step advances at most half a tile, so a projectile can never
//! tunnel through a wall or a player that lies on its motion segment.
//! Damage is applied here, atomically per target; the instance applies the
//! side effects (freeze, push, pull, life steal) when it consumes the
//! events.

use crate::characters::{self, AoeTrigger, ExplosionSpec, ProjectileDef};
use crate::game::registry::PlayerState;
use crate::game::spatial::SpatialGrid;
use crate::world::World;
use protocol::{Color, GameMode, PlayerId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Live projectiles per owner, beyond which spawns are refused.
const PER_PLAYER_CAP: usize = 16;

/// Projectile ids stay in the positive 31 bit range.
const MAX_ID: u32 = 0x7FFF_FFFF;

/// One projectile in flight.
pub struct Projectile {
    pub id: u32,
    pub owner: PlayerId,
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub color: Color,
    pub charge: u8,
    pub kind: u8,
    pub speed_multiplier: f32,
    pub distance: f32,
    pub bounces_left: u8,
    pub returning: bool,
    hit_set: HashSet<PlayerId>,
}

/// Copy of the fields a spawn broadcast needs.
#[derive(Debug, Clone, Copy)]
pub struct SpawnedProjectile {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub color: Color,
    pub charge: u8,
    pub kind: u8,
}

/// Everything a tick can report, in emission order.
#[derive(Debug, Clone, Copy)]
pub enum ProjectileEvent {
    Moved {
        id: u32,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
        color: Color,
        charge: u8,
        kind: u8,
    },
    Hit {
        id: u32,
        owner: PlayerId,
        target: PlayerId,
        damage: i32,
        kind: u8,
        charge: u8,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
    },
    Kill {
        id: u32,
        owner: PlayerId,
        target: PlayerId,
        damage: i32,
        kind: u8,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
    },
    AreaEffect {
        id: u32,
        x: f32,
        y: f32,
        kind: u8,
        color: Color,
    },
    AreaHit {
        owner: PlayerId,
        target: PlayerId,
        damage: i32,
        kind: u8,
    },
    AreaKill {
        owner: PlayerId,
        target: PlayerId,
        kind: u8,
    },
    Despawned {
        id: u32,
    },
}

/// Per-tick inputs the engine needs from the instance.
pub struct TickContext<'a> {
    pub world: &'a World,
    pub players: &'a HashMap<PlayerId, Arc<PlayerState>>,
    pub mode: GameMode,
    pub now: u64,
}

impl TickContext<'_> {
    /// Friendly fire exemption: same non-zero team in Teams mode. The
    /// owner may have left mid-flight, in which case nobody is a teammate.
    fn is_teammate(&self, owner: PlayerId, other: &PlayerState) -> bool {
        if self.mode != GameMode::Teams {
            return false;
        }
        let Some(owner_state) = self.players.get(&owner) else {
            return false;
        };
        owner_state.team_id != 0 && owner_state.team_id == other.team_id
    }
}

#[derive(Default)]
pub struct ProjectileEngine {
    projectiles: HashMap<u32, Projectile>,
    next_id: u32,
    grid: SpatialGrid,
}

impl ProjectileEngine {
    pub fn new() -> ProjectileEngine {
        ProjectileEngine::default()
    }

    pub fn len(&self) -> usize {
        self.projectiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projectiles.is_empty()
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id = if self.next_id >= MAX_ID { 1 } else { self.next_id + 1 };
        self.next_id
    }

    /// Spawns a projectile one cell ahead of the muzzle so the shooter
    /// cannot clip themselves. Refuses unknown types and owners at their
    /// projectile cap.
    pub fn spawn(
        &mut self,
        owner: PlayerId,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
        color: Color,
        charge: u8,
        kind: u8,
    ) -> Option<SpawnedProjectile> {
        let def = characters::projectile(kind)?;
        let live = self
            .projectiles
            .values()
            .filter(|p| p.owner == owner)
            .count();
        if live >= PER_PLAYER_CAP {
            return None;
        }
        let magnitude = (dx * dx + dy * dy).sqrt();
        let (sx, sy) = if magnitude > f32::EPSILON {
            (x + dx / magnitude, y + dy / magnitude)
        } else {
            (x, y)
        };
        let id = self.allocate_id();
        let projectile = Projectile {
            id,
            owner,
            x: sx,
            y: sy,
            dx,
            dy,
            color,
            charge,
            kind,
            speed_multiplier: def.speed_multiplier,
            distance: 0.0,
            bounces_left: def.bounces,
            returning: false,
            hit_set: HashSet::new(),
        };
        let snapshot = SpawnedProjectile {
            id,
            x: sx,
            y: sy,
            dx,
            dy,
            color,
            charge,
            kind,
        };
        self.projectiles.insert(id, projectile);
        Some(snapshot)
    }

    /// Steps every projectile once. Events come back in deterministic
    /// order: ascending projectile id, sub-step order within one
    /// projectile.
    pub fn tick(&mut self, ctx: &TickContext<'_>) -> Vec<ProjectileEvent> {
        let mut events = Vec::new();
        self.grid.rebuild(ctx.players.values(), ctx.now);

        let mut ids: Vec<u32> = self.projectiles.keys().copied().collect();
        ids.sort_unstable();
        let mut removals = Vec::new();

        for id in ids {
            let removed = {
                let projectile = self
                    .projectiles
                    .get_mut(&id)
                    .expect("projectile vanished mid-tick");
                step_projectile(projectile, ctx, &self.grid, &mut events)
            };
            if removed {
                removals.push(id);
            } else {
                let q = &self.projectiles[&id];
                events.push(ProjectileEvent::Moved {
                    id: q.id,
                    x: q.x,
                    y: q.y,
                    dx: q.dx,
                    dy: q.dy,
                    color: q.color,
                    charge: q.charge,
                    kind: q.kind,
                });
            }
        }

        for id in removals {
            self.projectiles.remove(&id);
        }
        events
    }
}

/// Advances one projectile through its steps and sub-steps. Returns true
/// when the projectile resolved and must be removed.
fn step_projectile(
    q: &mut Projectile,
    ctx: &TickContext<'_>,
    grid: &SpatialGrid,
    events: &mut Vec<ProjectileEvent>,
) -> bool {
    let Some(def) = characters::projectile(q.kind) else {
        events.push(ProjectileEvent::Despawned { id: q.id });
        return true;
    };

    // Gem boost on the owner doubles the travel this tick.
    let steps = ctx
        .players
        .get(&q.owner)
        .is_some_and(|owner| owner.has_gem_boost(ctx.now))
        .then_some(2)
        .unwrap_or(1);

    let speed = (q.dx * q.dx + q.dy * q.dy).sqrt() * q.speed_multiplier;
    let sub_steps = ((speed / 0.5).ceil() as u32).max(1);
    let fraction = 1.0 / sub_steps as f32;

    for _ in 0..steps {
        for _ in 0..sub_steps {
            let step_x = q.dx * q.speed_multiplier * fraction;
            let step_y = q.dy * q.speed_multiplier * fraction;
            let prev_tile = (q.x.floor() as i32, q.y.floor() as i32);
            q.x += step_x;
            q.y += step_y;
            q.distance += speed * fraction;

            // Max range, stretched by the charge level.
            if q.distance >= def.effective_range(q.charge) {
                if def.boomerang && !q.returning {
                    q.dx = -q.dx;
                    q.dy = -q.dy;
                    q.returning = true;
                    q.distance = 0.0;
                    q.hit_set.clear();
                    continue;
                }
                if let Some(aoe) = def.aoe
                    && aoe.trigger == AoeTrigger::OnMaxRange
                {
                    apply_aoe(
                        q.owner,
                        (q.x, q.y),
                        aoe.radius,
                        |_| aoe.damage,
                        aoe.freeze_ms,
                        aoe.root_ms,
                        None,
                        def,
                        ctx,
                        grid,
                        events,
                    );
                }
                return resolve_detonation(q, def, ctx, grid, events);
            }

            // World bounds.
            let tile = (q.x.floor() as i32, q.y.floor() as i32);
            if !ctx.world.in_bounds(tile.0, tile.1) {
                return resolve_detonation(q, def, ctx, grid, events);
            }

            // Solid tiles: pass, bounce or resolve.
            if !ctx.world.is_walkable(tile.0, tile.1) {
                let fence = ctx.world.is_fence(tile.0, tile.1);
                if def.passes_walls && !fence {
                    // Flies straight through masonry; fences stop anything.
                } else if q.bounces_left > 0 && !fence {
                    if tile.0 != prev_tile.0 {
                        q.dx = -q.dx;
                    }
                    if tile.1 != prev_tile.1 {
                        q.dy = -q.dy;
                    }
                    q.bounces_left -= 1;
                    // Step back inside the previous tile.
                    q.x = prev_tile.0 as f32 + 0.5;
                    q.y = prev_tile.1 as f32 + 0.5;
                } else {
                    return resolve_detonation(q, def, ctx, grid, events);
                }
            }

            // Player collision, first match in spatial order wins.
            let mut victim: Option<Arc<PlayerState>> = None;
            grid.for_each_nearby(q.x, q.y, |candidate| {
                if victim.is_some() {
                    return;
                }
                if candidate.id == q.owner
                    || q.hit_set.contains(&candidate.id)
                    || ctx.is_teammate(q.owner, candidate)
                {
                    return;
                }
                if candidate.position() == tile {
                    victim = Some(candidate.clone());
                }
            });

            if let Some(target) = victim {
                if def.explodes_on_player_hit() {
                    return resolve_detonation(q, def, ctx, grid, events);
                }
                let damage = def.effective_damage(q.charge, q.distance);
                let (prev, post) = target.apply_damage(damage);
                if prev <= 0 {
                    // Already dead this tick; no event, keep flying.
                    continue;
                }
                q.hit_set.insert(target.id);
                if post <= 0 {
                    events.push(ProjectileEvent::Kill {
                        id: q.id,
                        owner: q.owner,
                        target: target.id,
                        damage,
                        kind: q.kind,
                        x: q.x,
                        y: q.y,
                        dx: q.dx,
                        dy: q.dy,
                    });
                } else {
                    events.push(ProjectileEvent::Hit {
                        id: q.id,
                        owner: q.owner,
                        target: target.id,
                        damage,
                        kind: q.kind,
                        charge: q.charge,
                        x: q.x,
                        y: q.y,
                        dx: q.dx,
                        dy: q.dy,
                    });
                }
                if let Some(aoe) = def.aoe
                    && aoe.trigger == AoeTrigger::OnHit
                {
                    // The direct target is excluded so it is not damaged
                    // twice by its own hit.
                    apply_aoe(
                        q.owner,
                        (q.x, q.y),
                        aoe.radius,
                        |_| aoe.damage,
                        aoe.freeze_ms,
                        aoe.root_ms,
                        Some(target.id),
                        def,
                        ctx,
                        grid,
                        events,
                    );
                }
                let pierced = def.pierce > 0 && q.hit_set.len() < def.pierce as usize;
                if !pierced {
                    events.push(ProjectileEvent::Despawned { id: q.id });
                    return true;
                }
            }
        }
    }
    false
}

/// Final resolution of a projectile that hit a wall, the world edge, its
/// max range or an exploding-on-contact victim. Explosive types detonate
/// with radial damage; everything else just despawns.
fn resolve_detonation(
    q: &Projectile,
    def: &'static ProjectileDef,
    ctx: &TickContext<'_>,
    grid: &SpatialGrid,
    events: &mut Vec<ProjectileEvent>,
) -> bool {
    if let Some(explosion) = def.explosion {
        events.push(ProjectileEvent::AreaEffect {
            id: q.id,
            x: q.x,
            y: q.y,
            kind: q.kind,
            color: q.color,
        });
        apply_aoe(
            q.owner,
            (q.x, q.y),
            explosion.radius,
            |dist| blast_damage(explosion, dist),
            0,
            0,
            None,
            def,
            ctx,
            grid,
            events,
        );
    } else {
        events.push(ProjectileEvent::Despawned { id: q.id });
    }
    true
}

/// Linear falloff from center damage to edge damage across the radius.
fn blast_damage(spec: ExplosionSpec, dist: f32) -> i32 {
    if spec.radius <= f32::EPSILON {
        return spec.center_damage;
    }
    let t = (dist / spec.radius).clamp(0.0, 1.0);
    spec.center_damage - ((spec.center_damage - spec.edge_damage) as f32 * t) as i32
}

/// Radial damage over the pre-built hittable array. The owner, the
/// optionally excluded direct-hit target and teammates are skipped.
#[allow(clippy::too_many_arguments)]
fn apply_aoe(
    owner: PlayerId,
    center: (f32, f32),
    radius: f32,
    damage_at: impl Fn(f32) -> i32,
    freeze_ms: u64,
    root_ms: u64,
    exclude: Option<PlayerId>,
    def: &'static ProjectileDef,
    ctx: &TickContext<'_>,
    grid: &SpatialGrid,
    events: &mut Vec<ProjectileEvent>,
) {
    for player in grid.hittable() {
        if player.id == owner || Some(player.id) == exclude {
            continue;
        }
        if ctx.is_teammate(owner, player) {
            continue;
        }
        let (px, py) = player.position();
        let dx = px as f32 + 0.5 - center.0;
        let dy = py as f32 + 0.5 - center.1;
        let dist = (dx * dx + dy * dy).sqrt();
        if dist > radius {
            continue;
        }
        let damage = damage_at(dist);
        let (prev, post) = player.apply_damage(damage);
        if prev <= 0 {
            continue;
        }
        if freeze_ms > 0 {
            player
                .frozen_until
                .store(ctx.now + freeze_ms, Ordering::Release);
        }
        if root_ms > 0 {
            player
                .rooted_until
                .store(ctx.now + root_ms, Ordering::Release);
        }
        if post <= 0 {
            events.push(ProjectileEvent::AreaKill {
                owner,
                target: player.id,
                kind: def.id,
            });
        } else {
            events.push(ProjectileEvent::AreaHit {
                owner,
                target: player.id,
                damage,
                kind: def.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characters::{
        PROJ_BOLT, PROJ_BOOMERANG_GLAIVE, PROJ_GRENADE, PROJ_PHANTOM_NEEDLE, PROJ_PIERCING_LANCE,
        PROJ_RICOCHET_BLADE,
    };
    use crate::clock::now_ms;
    use crate::world;

    fn player_at(n: u128, x: i32, y: i32, team: u8) -> (PlayerId, Arc<PlayerState>) {
        let id = PlayerId(n | 1 << 64);
        let p = Arc::new(PlayerState::new(
            id,
            format!("p{n}"),
            Color::default(),
            0,
            team,
            (x, y),
        ));
        (id, p)
    }

    struct Fixture {
        world: World,
        players: HashMap<PlayerId, Arc<PlayerState>>,
        mode: GameMode,
    }

    use crate::world::World;

    impl Fixture {
        fn new() -> Fixture {
            // Bastion: 48x48, open except for the border and the center
            // keep, so the flight paths below stay clear.
            Fixture {
                world: world::instantiate(1).unwrap(),
                players: HashMap::new(),
                mode: GameMode::Ffa,
            }
        }

        fn add(&mut self, n: u128, x: i32, y: i32, team: u8) -> Arc<PlayerState> {
            let (id, p) = player_at(n, x, y, team);
            self.players.insert(id, p.clone());
            p
        }

        fn ctx(&self) -> TickContext<'_> {
            TickContext {
                world: &self.world,
                players: &self.players,
                mode: self.mode,
                now: now_ms(),
            }
        }
    }

    fn tick_until<F: FnMut(&ProjectileEvent) -> bool>(
        engine: &mut ProjectileEngine,
        fixture: &Fixture,
        max_ticks: usize,
        mut pred: F,
    ) -> Option<ProjectileEvent> {
        for _ in 0..max_ticks {
            for event in engine.tick(&fixture.ctx()) {
                if pred(&event) {
                    return Some(event);
                }
            }
        }
        None
    }

    #[test]
    fn straight_shot_hits_the_player_ahead() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 5, 5, 0);
        let target = fixture.add(2, 5, 9, 0);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(shooter.id, 5.0, 5.0, 0.0, 1.0, Color::default(), 0, PROJ_BOLT)
            .unwrap();

        let hit = tick_until(&mut engine, &fixture, 20, |e| {
            matches!(e, ProjectileEvent::Hit { .. })
        });
        let Some(ProjectileEvent::Hit { target: t, damage, .. }) = hit else {
            panic!("expected a hit event");
        };
        assert_eq!(t, target.id);
        assert_eq!(target.health(), target.max_health - damage);
        assert!(engine.is_empty(), "non-piercing bolt despawns on hit");
    }

    #[test]
    fn kill_is_emitted_exactly_once_when_health_crosses_zero() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 5, 5, 0);
        let target = fixture.add(2, 5, 8, 0);
        target.apply_damage(target.max_health - 1); // one hit from death
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(shooter.id, 5.0, 5.0, 0.0, 1.0, Color::default(), 0, PROJ_BOLT)
            .unwrap();

        let mut kills = 0;
        for _ in 0..20 {
            for event in engine.tick(&fixture.ctx()) {
                if matches!(event, ProjectileEvent::Kill { .. }) {
                    kills += 1;
                }
            }
        }
        assert_eq!(kills, 1);
        assert!(target.health() <= 0);
    }

    #[test]
    fn pierce_hits_at_most_k_distinct_players() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 5, 5, 0);
        for (n, y) in [(2u128, 7), (3, 9), (4, 11), (5, 13)] {
            fixture.add(n, 5, y, 0);
        }
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(
                shooter.id,
                5.0,
                5.0,
                0.0,
                1.0,
                Color::default(),
                0,
                PROJ_PIERCING_LANCE,
            )
            .unwrap();

        let mut victims = Vec::new();
        for _ in 0..30 {
            for event in engine.tick(&fixture.ctx()) {
                if let ProjectileEvent::Hit { target, .. } = event {
                    victims.push(target);
                }
            }
        }
        // pierce = 3: at most three hits, all distinct.
        assert_eq!(victims.len(), 3);
        let unique: HashSet<_> = victims.iter().collect();
        assert_eq!(unique.len(), victims.len());
    }

    #[test]
    fn boomerang_reverses_once_and_despawns_at_home() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 10, 10, 0);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(
                shooter.id,
                10.0,
                10.0,
                1.0,
                0.0,
                Color::default(),
                0,
                PROJ_BOOMERANG_GLAIVE,
            )
            .unwrap();

        let mut max_x = 0.0f32;
        let mut despawn_x = None;
        for _ in 0..60 {
            for event in engine.tick(&fixture.ctx()) {
                match event {
                    ProjectileEvent::Moved { x, .. } => max_x = max_x.max(x),
                    ProjectileEvent::Despawned { .. } => despawn_x = Some(max_x),
                    _ => {}
                }
            }
            if despawn_x.is_some() {
                break;
            }
        }
        assert!(despawn_x.is_some(), "glaive must come back and despawn");
        assert!(max_x >= 15.0, "flew out to max range, got {max_x}");
        assert!(engine.is_empty());
    }

    #[test]
    fn sub_steps_never_skip_a_wall() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 2, 2, 0);
        // Wall right next to the flight path; high velocity would tunnel
        // without sub-stepping.
        fixture.world.set_tile(6, 2, crate::world::TILE_WALL);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(shooter.id, 2.0, 2.5, 1.4, 0.0, Color::default(), 0, PROJ_BOLT)
            .unwrap();

        let despawn = tick_until(&mut engine, &fixture, 20, |e| {
            matches!(e, ProjectileEvent::Despawned { .. })
        });
        assert!(despawn.is_some());
        assert!(engine.is_empty());
    }

    #[test]
    fn ricochet_reflects_and_eventually_despawns() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 3, 3, 0);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(
                shooter.id,
                3.0,
                3.5,
                -1.0,
                0.0,
                Color::default(),
                0,
                PROJ_RICOCHET_BLADE,
            )
            .unwrap();

        // Flies into the left border wall, must reflect back to the right.
        let mut saw_reflection = false;
        for _ in 0..40 {
            for event in engine.tick(&fixture.ctx()) {
                if let ProjectileEvent::Moved { dx, .. } = event
                    && dx > 0.0
                {
                    saw_reflection = true;
                }
            }
        }
        assert!(saw_reflection);
    }

    #[test]
    fn wall_passing_projectiles_ignore_masonry_but_not_fences() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 2, 2, 0);
        fixture.world.set_tile(5, 2, crate::world::TILE_WALL);
        let target = fixture.add(2, 8, 2, 0);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(
                shooter.id,
                2.0,
                2.5,
                1.0,
                0.0,
                Color::default(),
                0,
                PROJ_PHANTOM_NEEDLE,
            )
            .unwrap();
        let hit = tick_until(&mut engine, &fixture, 20, |e| {
            matches!(e, ProjectileEvent::Hit { .. })
        });
        assert!(hit.is_some(), "needle passes the wall and lands");
        assert!(target.health() < target.max_health);

        // A fence does stop it.
        fixture.world.set_tile(5, 2, crate::world::TILE_FENCE);
        engine
            .spawn(
                shooter.id,
                2.0,
                2.5,
                1.0,
                0.0,
                Color::default(),
                0,
                PROJ_PHANTOM_NEEDLE,
            )
            .unwrap();
        let despawn = tick_until(&mut engine, &fixture, 20, |e| {
            matches!(e, ProjectileEvent::Despawned { .. })
        });
        assert!(despawn.is_some());
    }

    #[test]
    fn teammates_are_exempt_from_friendly_fire() {
        let mut fixture = Fixture::new();
        fixture.mode = GameMode::Teams;
        let shooter = fixture.add(1, 5, 5, 1);
        let friend = fixture.add(2, 5, 8, 1);
        let enemy = fixture.add(3, 5, 11, 2);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(shooter.id, 5.0, 5.0, 0.0, 1.0, Color::default(), 0, PROJ_BOLT)
            .unwrap();

        let hit = tick_until(&mut engine, &fixture, 30, |e| {
            matches!(e, ProjectileEvent::Hit { .. })
        });
        let Some(ProjectileEvent::Hit { target, .. }) = hit else {
            panic!("expected the enemy to be hit");
        };
        assert_eq!(target, enemy.id);
        assert_eq!(friend.health(), friend.max_health);
    }

    #[test]
    fn grenade_detonates_on_contact_with_area_damage() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 5, 5, 0);
        let direct = fixture.add(2, 5, 8, 0);
        let bystander = fixture.add(3, 6, 8, 0);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(shooter.id, 5.0, 5.0, 0.0, 1.0, Color::default(), 0, PROJ_GRENADE)
            .unwrap();

        let blast = tick_until(&mut engine, &fixture, 20, |e| {
            matches!(e, ProjectileEvent::AreaEffect { .. })
        });
        assert!(blast.is_some());
        assert!(direct.health() < direct.max_health);
        assert!(bystander.health() < bystander.max_health);
        assert_eq!(shooter.health(), shooter.max_health, "owner is spared");
    }

    #[test]
    fn owner_departure_keeps_the_projectile_flying() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 5, 5, 0);
        let target = fixture.add(2, 5, 12, 0);
        let mut engine = ProjectileEngine::new();
        engine
            .spawn(shooter.id, 5.0, 5.0, 0.0, 1.0, Color::default(), 0, PROJ_BOLT)
            .unwrap();
        fixture.players.remove(&shooter.id);

        let hit = tick_until(&mut engine, &fixture, 30, |e| {
            matches!(e, ProjectileEvent::Hit { .. })
        });
        assert!(hit.is_some());
        assert!(target.health() < target.max_health);
    }

    #[test]
    fn per_player_cap_rejects_further_spawns() {
        let mut fixture = Fixture::new();
        let shooter = fixture.add(1, 30, 30, 0);
        let mut engine = ProjectileEngine::new();
        for _ in 0..PER_PLAYER_CAP {
            assert!(
                engine
                    .spawn(shooter.id, 30.0, 30.0, 0.0, 1.0, Color::default(), 0, PROJ_BOLT)
                    .is_some()
            );
        }
        assert!(
            engine
                .spawn(shooter.id, 30.0, 30.0, 0.0, 1.0, Color::default(), 0, PROJ_BOLT)
                .is_none()
        );
    }
}
