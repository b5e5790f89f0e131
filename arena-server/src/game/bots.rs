//! The bot controller. One task per instance drives every bot on the
//! roster: a short think tick that walks toward the nearest opponent and
//! fires the character's primary projectile when in range. Bots go through
//! the same engine and broadcast paths as humans, but never through the
//! movement validator — the server is the author of their claims.

use crate::characters;
use crate::clock::now_ms;
use crate::game::GameInstance;
use crate::game::registry::PlayerState;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Bot think interval.
const THINK_MS: u64 = 400;
/// Bots only open fire within this Euclidean distance.
const FIRE_RANGE: f32 = 9.0;
/// Chance per think tick to wander instead of chasing.
const WANDER_CHANCE: f64 = 0.25;
/// Angular jitter applied to every bot shot, radians to either side.
const FIRE_SPREAD: f32 = 0.2;

pub async fn run(instance: Arc<GameInstance>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(THINK_MS));
    loop {
        interval.tick().await;
        if instance.has_ended() {
            return;
        }
        step(&instance).await;
    }
}

async fn step(instance: &GameInstance) {
    let roster = instance.registry.all();
    let now = now_ms();
    for bot in roster.iter().filter(|p| p.id.is_bot()) {
        if !bot.is_alive() || bot.is_frozen(now) || bot.is_rooted(now) {
            continue;
        }
        let target = nearest_opponent(instance, bot, &roster);
        walk(instance, bot, target.as_deref(), now).await;
        if let Some(target) = target {
            fire(instance, bot, &target, now).await;
        }
    }
}

fn nearest_opponent(
    instance: &GameInstance,
    bot: &Arc<PlayerState>,
    roster: &[Arc<PlayerState>],
) -> Option<Arc<PlayerState>> {
    let (bx, by) = bot.position();
    roster
        .iter()
        .filter(|p| p.id != bot.id && p.is_alive() && !instance.is_teammate(bot, p))
        .min_by_key(|p| {
            let (px, py) = p.position();
            (px - bx).abs() + (py - by).abs()
        })
        .cloned()
}

/// One tile toward the target, or a random walkable neighbor when
/// wandering or blocked.
async fn walk(
    instance: &GameInstance,
    bot: &Arc<PlayerState>,
    target: Option<&PlayerState>,
    now: u64,
) {
    let (bx, by) = bot.position();

    // The thread-local rng must not live across the broadcast await.
    let candidates: Vec<(i32, i32)> = {
        let mut rng = rand::thread_rng();
        let preferred = target.filter(|_| !rng.gen_bool(WANDER_CHANCE)).map(|t| {
            let (tx, ty) = t.position();
            if (tx - bx).abs() >= (ty - by).abs() {
                ((tx - bx).signum(), 0)
            } else {
                (0, (ty - by).signum())
            }
        });

        let mut candidates = Vec::with_capacity(5);
        if let Some(step) = preferred {
            candidates.push(step);
        }
        let mut sides = [(1, 0), (-1, 0), (0, 1), (0, -1)];
        // Shuffle by hand; four elements do not warrant the full trait.
        for i in (1..sides.len()).rev() {
            sides.swap(i, rng.gen_range(0..=i));
        }
        candidates.extend(sides);
        candidates
    };

    for (dx, dy) in candidates {
        if dx == 0 && dy == 0 {
            continue;
        }
        let (nx, ny) = (bx + dx, by + dy);
        if instance.world.is_walkable(nx, ny) {
            bot.set_position(nx, ny);
            instance.broadcast_player_state(bot, now).await;
            return;
        }
    }
}

async fn fire(instance: &GameInstance, bot: &Arc<PlayerState>, target: &PlayerState, now: u64) {
    let Some(class) = characters::character(bot.character_id) else {
        return;
    };
    let cooldown = instance.config.shoot_cooldown_ms * 2;
    if now.saturating_sub(bot.last_primary_fire.load(Ordering::Acquire)) < cooldown {
        return;
    }
    let (bx, by) = bot.position();
    let (tx, ty) = target.position();
    let dx = (tx - bx) as f32;
    let dy = (ty - by) as f32;
    let dist = (dx * dx + dy * dy).sqrt();
    if dist > FIRE_RANGE || dist < f32::EPSILON {
        return;
    }
    // Bots are not sharpshooters; jitter the aim. The rng scope ends
    // before the broadcast await.
    let (aim_x, aim_y) = {
        let jitter = rand::thread_rng().gen_range(-FIRE_SPREAD..=FIRE_SPREAD);
        super::rotate(dx / dist, dy / dist, jitter)
    };
    bot.last_primary_fire.store(now, Ordering::Release);
    instance
        .spawn_and_announce(
            bot.id,
            bx as f32,
            by as f32,
            aim_x,
            aim_y,
            bot.color,
            0,
            class.primary,
        )
        .await;
}
