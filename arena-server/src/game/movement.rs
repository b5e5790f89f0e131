//! The per-player gatekeeper for client-claimed movement and projectile
//! spawns. Every check runs against the authoritative state; a rejection
//! leaves that state untouched and the client simply never sees its claim
//! rebroadcast.

use crate::characters::{self, AbilitySlot, CastBehavior, ProjectileDef};
use crate::game::registry::{Facing, PlayerState};
use crate::world::World;
use std::sync::atomic::Ordering;

/// Why a position update was rejected. Only ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveReject {
    OutOfBounds,
    Unwalkable,
    TooFast { claimed: i32, allowed: i32 },
    Pinned,
    TeleportLock,
}

/// Why a projectile spawn was rejected. Only ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnReject {
    UnknownCharacter,
    NotInKit,
    TooFarFromPlayer,
    ExcessiveVelocity,
    OnCooldown,
}

/// A projectile spawn that passed validation, with everything the caller
/// needs to execute the cast.
pub struct SpawnApproval {
    pub def: &'static ProjectileDef,
    pub slot: AbilitySlot,
    pub behavior: CastBehavior,
}

/// Stateless validator; per-player bookkeeping lives on [`PlayerState`].
pub struct MovementValidator {
    move_rate_limit_ms: u64,
    shoot_cooldown_ms: u64,
}

impl MovementValidator {
    pub fn new(move_rate_limit_ms: u64, shoot_cooldown_ms: u64) -> MovementValidator {
        MovementValidator {
            move_rate_limit_ms,
            shoot_cooldown_ms,
        }
    }

    /// Validates a claimed position and, on success, commits it together
    /// with the derived facing and the update timestamp.
    pub fn validate_move(
        &self,
        player: &PlayerState,
        world: &World,
        x: i32,
        y: i32,
        now: u64,
    ) -> Result<(), MoveReject> {
        if player.server_teleport_until.load(Ordering::Acquire) > now {
            // A server-forced teleport wins over in-flight client updates.
            return Err(MoveReject::TeleportLock);
        }
        if player.is_frozen(now) || player.is_rooted(now) {
            return Err(MoveReject::Pinned);
        }
        if !world.in_bounds(x, y) {
            return Err(MoveReject::OutOfBounds);
        }
        if !world.is_walkable(x, y) && !player.is_phased(now) {
            return Err(MoveReject::Unwalkable);
        }

        let (px, py) = player.position();
        let manhattan = (x - px).abs() + (y - py).abs();
        let dt = now.saturating_sub(player.last_move.load(Ordering::Acquire));
        let mut allowed = (2 * dt / self.move_rate_limit_ms.max(1)) as i32 + 2;
        let class = characters::character(player.character_id);
        if player.has_speed_boost(now)
            && let Some(dash) = class.and_then(|c| c.dash_distance())
        {
            allowed += dash;
        }

        if manhattan > allowed {
            let blink_ok = class
                .and_then(|c| c.teleport_range())
                .is_some_and(|range| manhattan <= range + 2);
            let waived = !blink_ok && player.teleport_waiver.swap(false, Ordering::AcqRel);
            if !blink_ok && !waived {
                return Err(MoveReject::TooFast {
                    claimed: manhattan,
                    allowed,
                });
            }
        }

        player.set_position(x, y);
        if (x - px).abs() >= (y - py).abs() && x != px {
            player.set_facing(if x > px { Facing::Right } else { Facing::Left });
        } else if y != py {
            player.set_facing(if y > py { Facing::Down } else { Facing::Up });
        }
        player.last_move.store(now, Ordering::Release);
        Ok(())
    }

    /// Validates a projectile spawn claim and, on success, stamps the
    /// fired slot's cooldown.
    pub fn validate_spawn(
        &self,
        player: &PlayerState,
        kind: u8,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
        now: u64,
    ) -> Result<SpawnApproval, SpawnReject> {
        let Some(class) = characters::character(player.character_id) else {
            return Err(SpawnReject::UnknownCharacter);
        };
        let Some(slot) = class.slot_for(kind) else {
            return Err(SpawnReject::NotInKit);
        };
        // The codec already rejects non-finite floats; keep the magnitude
        // and origin checks here where the player position is known.
        let (px, py) = player.position();
        if (x - px as f32).abs() > 3.0 || (y - py as f32).abs() > 3.0 {
            return Err(SpawnReject::TooFarFromPlayer);
        }
        if !dx.is_finite() || !dy.is_finite() || dx * dx + dy * dy > 2.0 {
            return Err(SpawnReject::ExcessiveVelocity);
        }

        let (stamp, gap) = match slot {
            AbilitySlot::Primary => (
                &player.last_primary_fire,
                self.shoot_cooldown_ms * 8 / 10,
            ),
            AbilitySlot::Q => (&player.last_q_cast, class.ability_q.cooldown_ms),
            AbilitySlot::E => (&player.last_e_cast, class.ability_e.cooldown_ms),
        };
        let last = stamp.load(Ordering::Acquire);
        if now.saturating_sub(last) < gap {
            return Err(SpawnReject::OnCooldown);
        }
        stamp.store(now, Ordering::Release);

        let behavior = match slot {
            AbilitySlot::Primary => CastBehavior::Standard,
            AbilitySlot::Q => class.ability_q.behavior,
            AbilitySlot::E => class.ability_e.behavior,
        };
        let def = characters::projectile(kind).ok_or(SpawnReject::NotInKit)?;
        Ok(SpawnApproval {
            def,
            slot,
            behavior,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characters::{PROJ_BOLT, PROJ_GRENADE, PROJ_PIERCING_LANCE};
    use crate::clock::now_ms;
    use crate::world;
    use protocol::{Color, PlayerId};

    fn validator() -> MovementValidator {
        MovementValidator::new(100, 500)
    }

    fn player_at(x: i32, y: i32) -> PlayerState {
        PlayerState::new(
            PlayerId(7 << 64),
            "tester".into(),
            Color::default(),
            0,
            0,
            (x, y),
        )
    }

    #[test]
    fn small_steps_are_accepted_and_committed() {
        let world = world::instantiate(0).unwrap();
        let p = player_at(5, 5);
        let now = now_ms();
        assert!(validator().validate_move(&p, &world, 6, 5, now).is_ok());
        assert_eq!(p.position(), (6, 5));
        assert_eq!(p.facing(), Facing::Right);
    }

    #[test]
    fn teleport_jumps_are_rejected_for_non_blink_characters() {
        let world = world::instantiate(0).unwrap();
        let p = player_at(2, 2);
        let now = now_ms();
        p.last_move
            .store(now.saturating_sub(50), Ordering::Release);
        let verdict = validator().validate_move(&p, &world, 25, 25, now);
        assert!(matches!(verdict, Err(MoveReject::TooFast { .. })));
        assert_eq!(p.position(), (2, 2), "authoritative state unchanged");
    }

    #[test]
    fn blink_characters_may_jump_their_teleport_range() {
        let world = world::instantiate(0).unwrap();
        let mut p = player_at(5, 5);
        p.character_id = 2; // frostweaver, teleport range 6
        let now = now_ms();
        p.last_move
            .store(now.saturating_sub(50), Ordering::Release);
        assert!(validator().validate_move(&p, &world, 11, 5, now).is_ok());
    }

    #[test]
    fn star_waiver_admits_exactly_one_jump() {
        let world = world::instantiate(0).unwrap();
        let p = player_at(2, 2);
        let now = now_ms();
        p.teleport_waiver.store(true, Ordering::Release);
        p.last_move
            .store(now.saturating_sub(50), Ordering::Release);
        assert!(validator().validate_move(&p, &world, 20, 20, now).is_ok());
        p.last_move
            .store(now.saturating_sub(50), Ordering::Release);
        assert!(validator().validate_move(&p, &world, 2, 2, now).is_err());
    }

    #[test]
    fn walls_reject_unphased_players_only() {
        let world = world::instantiate(0).unwrap();
        let p = player_at(1, 1);
        let now = now_ms();
        assert_eq!(
            validator().validate_move(&p, &world, 0, 1, now),
            Err(MoveReject::Unwalkable)
        );
        p.phased_until.store(now + 1_000, Ordering::Release);
        assert!(validator().validate_move(&p, &world, 0, 1, now).is_ok());
    }

    #[test]
    fn spawn_rejects_remote_origins_and_hot_velocity() {
        let p = player_at(5, 5);
        let now = now_ms();
        let v = validator();
        assert_eq!(
            v.validate_spawn(&p, PROJ_BOLT, 9.5, 5.0, 0.0, 1.0, now).err(),
            Some(SpawnReject::TooFarFromPlayer)
        );
        assert_eq!(
            v.validate_spawn(&p, PROJ_BOLT, 5.0, 5.0, 1.5, 1.5, now).err(),
            Some(SpawnReject::ExcessiveVelocity)
        );
        assert_eq!(
            v.validate_spawn(&p, PROJ_GRENADE, 5.0, 5.0, 0.0, 1.0, now).err(),
            Some(SpawnReject::NotInKit)
        );
    }

    #[test]
    fn primary_fire_rate_is_gated_but_abilities_have_own_cooldowns() {
        let p = player_at(5, 5);
        let now = now_ms();
        let v = validator();
        assert!(v.validate_spawn(&p, PROJ_BOLT, 5.0, 5.0, 0.0, 1.0, now).is_ok());
        // 0.8 * 500ms gap: an immediate second shot is too soon.
        assert_eq!(
            v.validate_spawn(&p, PROJ_BOLT, 5.0, 5.0, 0.0, 1.0, now + 100).err(),
            Some(SpawnReject::OnCooldown)
        );
        // The Q ability ignores the primary gap.
        assert!(
            v.validate_spawn(&p, PROJ_PIERCING_LANCE, 5.0, 5.0, 0.0, 1.0, now + 100)
                .is_ok()
        );
        assert!(v.validate_spawn(&p, PROJ_BOLT, 5.0, 5.0, 0.0, 1.0, now + 401).is_ok());
    }
}
