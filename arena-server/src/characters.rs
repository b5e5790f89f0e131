//! Static definition tables for characters and projectile types. Both are
//! built into the binary and treated as immutable; new characters are added
//! by extending the tables.

/// What happens when a projectile connects with a player.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OnHitEffect {
    None,
    /// Drag the victim next to the shooter.
    PullToOwner,
    Freeze { ms: u64 },
    /// Swap the shooter to the tile behind the victim and freeze the victim.
    TeleportBehind { distance: i32, freeze_ms: u64 },
    /// Knock the victim back along the projectile's flight direction.
    Push { distance: i32 },
    /// Heal the shooter for a percentage of the damage dealt.
    LifeSteal { percent: u32 },
}

/// Explosion parameters for projectiles that detonate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExplosionSpec {
    pub center_damage: i32,
    pub edge_damage: i32,
    pub radius: f32,
}

/// When a projectile's area-of-effect component fires.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AoeTrigger {
    OnHit,
    OnMaxRange,
}

/// Area-of-effect parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AoeSpec {
    pub trigger: AoeTrigger,
    pub radius: f32,
    pub damage: i32,
    pub freeze_ms: u64,
    pub root_ms: u64,
}

/// Immutable description of one projectile type.
#[derive(Debug)]
pub struct ProjectileDef {
    pub id: u8,
    pub name: &'static str,
    pub base_damage: i32,
    pub max_range: f32,
    pub speed_multiplier: f32,
    pub on_hit: OnHitEffect,
    /// Number of distinct players one projectile may pass through.
    pub pierce: u8,
    /// Number of wall ricochets before the projectile despawns.
    pub bounces: u8,
    pub passes_walls: bool,
    /// Detonates instead of applying plain damage when set.
    pub explosion: Option<ExplosionSpec>,
    pub aoe: Option<AoeSpec>,
    pub boomerang: bool,
    /// Burning duration applied on hit, 0 for none.
    pub ignite_ms: u64,
}

impl ProjectileDef {
    /// Damage after the charge bonus and long-range falloff. Charge adds up
    /// to 100% on top of the base; shots past three quarters of the range
    /// lose a quarter.
    pub fn effective_damage(&self, charge: u8, distance: f32) -> i32 {
        let boosted = self.base_damage * (100 + charge.min(100) as i32) / 100;
        if distance > self.effective_range(charge) * 0.75 {
            boosted * 3 / 4
        } else {
            boosted
        }
    }

    /// Flight range after the charge bonus: up to half the base range on
    /// top at full charge.
    pub fn effective_range(&self, charge: u8) -> f32 {
        self.max_range * (1.0 + charge.min(100) as f32 / 200.0)
    }

    pub fn explodes_on_player_hit(&self) -> bool {
        self.explosion.is_some()
    }
}

/// How an ability resolves when cast.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CastBehavior {
    /// One projectile of the ability's type.
    Standard,
    /// `count` projectiles spread over `spread` radians.
    Fan { count: u8, spread: f32 },
    /// Instant area damage centered on the caster.
    GroundSlam { radius: f32 },
    /// The caster phases through walls and cannot be hit.
    PhaseShift { duration_ms: u64 },
    /// Burst of movement; the validator honors the extra distance.
    Dash { max_distance: i32, duration_ms: u64 },
    /// Blink to a target tile; validated as movement, not as a projectile.
    Teleport { max_distance: i32 },
}

/// One castable ability slot.
#[derive(Debug)]
pub struct Ability {
    pub cooldown_ms: u64,
    pub behavior: CastBehavior,
    /// Projectile type fired (or used for damage numbers) by this ability.
    pub projectile: u8,
}

/// Immutable description of one playable character class.
#[derive(Debug)]
pub struct CharacterDef {
    pub id: u8,
    pub name: &'static str,
    pub max_health: i32,
    /// Primary-fire projectile type, limited by the shot cooldown.
    pub primary: u8,
    pub ability_q: Ability,
    pub ability_e: Ability,
}

impl CharacterDef {
    /// The ability slot a projectile type belongs to for this character,
    /// or `None` when the character cannot fire that type at all.
    pub fn slot_for(&self, projectile: u8) -> Option<AbilitySlot> {
        if projectile == self.primary {
            Some(AbilitySlot::Primary)
        } else if projectile == self.ability_q.projectile
            && !matches!(self.ability_q.behavior, CastBehavior::Teleport { .. })
        {
            Some(AbilitySlot::Q)
        } else if projectile == self.ability_e.projectile
            && !matches!(self.ability_e.behavior, CastBehavior::Teleport { .. })
        {
            Some(AbilitySlot::E)
        } else {
            None
        }
    }

    /// The teleport range of the E ability, if it is a teleport cast. The
    /// movement validator uses this to allow blink-sized jumps.
    pub fn teleport_range(&self) -> Option<i32> {
        match self.ability_e.behavior {
            CastBehavior::Teleport { max_distance } => Some(max_distance),
            _ => None,
        }
    }

    /// The dash distance of an active dash buff, if either ability grants
    /// one.
    pub fn dash_distance(&self) -> Option<i32> {
        for ability in [&self.ability_q, &self.ability_e] {
            if let CastBehavior::Dash { max_distance, .. } = ability.behavior {
                return Some(max_distance);
            }
        }
        None
    }
}

/// Which slot an incoming projectile spawn maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbilitySlot {
    Primary,
    Q,
    E,
}

// Projectile type ids.
pub const PROJ_BOLT: u8 = 0;
pub const PROJ_HEAVY_ORB: u8 = 1;
pub const PROJ_FROST_SHARD: u8 = 2;
pub const PROJ_RICOCHET_BLADE: u8 = 3;
pub const PROJ_PIERCING_LANCE: u8 = 4;
pub const PROJ_PHANTOM_NEEDLE: u8 = 5;
pub const PROJ_BOOMERANG_GLAIVE: u8 = 6;
pub const PROJ_GRENADE: u8 = 7;
pub const PROJ_PULL_HOOK: u8 = 8;
pub const PROJ_SHADOW_FANG: u8 = 9;
pub const PROJ_LEECH_DART: u8 = 10;
pub const PROJ_EMBER_SHOT: u8 = 11;
pub const PROJ_SLAM_WAVE: u8 = 12;
pub const PROJ_ARC_BURST: u8 = 13;

const PROJECTILES: &[ProjectileDef] = &[
    ProjectileDef {
        id: PROJ_BOLT,
        name: "bolt",
        base_damage: 10,
        max_range: 12.0,
        speed_multiplier: 1.0,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_HEAVY_ORB,
        name: "heavy orb",
        base_damage: 18,
        max_range: 8.0,
        speed_multiplier: 0.75,
        on_hit: OnHitEffect::Push { distance: 2 },
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_FROST_SHARD,
        name: "frost shard",
        base_damage: 6,
        max_range: 10.0,
        speed_multiplier: 1.1,
        on_hit: OnHitEffect::Freeze { ms: 1_500 },
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_RICOCHET_BLADE,
        name: "ricochet blade",
        base_damage: 8,
        max_range: 16.0,
        speed_multiplier: 1.0,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 3,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_PIERCING_LANCE,
        name: "piercing lance",
        base_damage: 9,
        max_range: 11.0,
        speed_multiplier: 1.2,
        on_hit: OnHitEffect::None,
        pierce: 3,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_PHANTOM_NEEDLE,
        name: "phantom needle",
        base_damage: 7,
        max_range: 10.0,
        speed_multiplier: 1.0,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 0,
        passes_walls: true,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_BOOMERANG_GLAIVE,
        name: "boomerang glaive",
        base_damage: 11,
        max_range: 5.0,
        speed_multiplier: 0.9,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: true,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_GRENADE,
        name: "grenade",
        base_damage: 0,
        max_range: 7.0,
        speed_multiplier: 0.8,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: Some(ExplosionSpec {
            center_damage: 20,
            edge_damage: 8,
            radius: 2.5,
        }),
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_PULL_HOOK,
        name: "pull hook",
        base_damage: 5,
        max_range: 9.0,
        speed_multiplier: 1.3,
        on_hit: OnHitEffect::PullToOwner,
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_SHADOW_FANG,
        name: "shadow fang",
        base_damage: 8,
        max_range: 8.0,
        speed_multiplier: 1.2,
        on_hit: OnHitEffect::TeleportBehind {
            distance: 1,
            freeze_ms: 800,
        },
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_LEECH_DART,
        name: "leech dart",
        base_damage: 9,
        max_range: 10.0,
        speed_multiplier: 1.0,
        on_hit: OnHitEffect::LifeSteal { percent: 50 },
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_EMBER_SHOT,
        name: "ember shot",
        base_damage: 6,
        max_range: 9.0,
        speed_multiplier: 1.0,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 2_000,
    },
    ProjectileDef {
        id: PROJ_SLAM_WAVE,
        name: "slam wave",
        base_damage: 14,
        max_range: 1.0,
        speed_multiplier: 1.0,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: None,
        boomerang: false,
        ignite_ms: 0,
    },
    ProjectileDef {
        id: PROJ_ARC_BURST,
        name: "arc burst",
        base_damage: 7,
        max_range: 6.0,
        speed_multiplier: 1.0,
        on_hit: OnHitEffect::None,
        pierce: 0,
        bounces: 0,
        passes_walls: false,
        explosion: None,
        aoe: Some(AoeSpec {
            trigger: AoeTrigger::OnMaxRange,
            radius: 2.0,
            damage: 8,
            freeze_ms: 0,
            root_ms: 600,
        }),
        boomerang: false,
        ignite_ms: 0,
    },
];

const CHARACTERS: &[CharacterDef] = &[
    CharacterDef {
        id: 0,
        name: "ranger",
        max_health: 100,
        primary: PROJ_BOLT,
        ability_q: Ability {
            cooldown_ms: 4_000,
            behavior: CastBehavior::Fan {
                count: 5,
                spread: 0.6,
            },
            projectile: PROJ_PIERCING_LANCE,
        },
        ability_e: Ability {
            cooldown_ms: 6_000,
            behavior: CastBehavior::Dash {
                max_distance: 4,
                duration_ms: 1_500,
            },
            projectile: PROJ_BOLT,
        },
    },
    CharacterDef {
        id: 1,
        name: "warden",
        max_health: 130,
        primary: PROJ_HEAVY_ORB,
        ability_q: Ability {
            cooldown_ms: 6_000,
            behavior: CastBehavior::GroundSlam { radius: 2.5 },
            projectile: PROJ_SLAM_WAVE,
        },
        ability_e: Ability {
            cooldown_ms: 8_000,
            behavior: CastBehavior::PhaseShift { duration_ms: 2_000 },
            projectile: PROJ_HEAVY_ORB,
        },
    },
    CharacterDef {
        id: 2,
        name: "frostweaver",
        max_health: 90,
        primary: PROJ_FROST_SHARD,
        ability_q: Ability {
            cooldown_ms: 5_000,
            behavior: CastBehavior::Standard,
            projectile: PROJ_ARC_BURST,
        },
        ability_e: Ability {
            cooldown_ms: 9_000,
            behavior: CastBehavior::Teleport { max_distance: 6 },
            projectile: PROJ_FROST_SHARD,
        },
    },
    CharacterDef {
        id: 3,
        name: "reaper",
        max_health: 95,
        primary: PROJ_LEECH_DART,
        ability_q: Ability {
            cooldown_ms: 7_000,
            behavior: CastBehavior::Standard,
            projectile: PROJ_SHADOW_FANG,
        },
        ability_e: Ability {
            cooldown_ms: 5_000,
            behavior: CastBehavior::Standard,
            projectile: PROJ_EMBER_SHOT,
        },
    },
    CharacterDef {
        id: 4,
        name: "sapper",
        max_health: 110,
        primary: PROJ_RICOCHET_BLADE,
        ability_q: Ability {
            cooldown_ms: 6_000,
            behavior: CastBehavior::Standard,
            projectile: PROJ_GRENADE,
        },
        ability_e: Ability {
            cooldown_ms: 5_000,
            behavior: CastBehavior::Standard,
            projectile: PROJ_PULL_HOOK,
        },
    },
];

/// Looks up a character class by id.
pub fn character(id: u8) -> Option<&'static CharacterDef> {
    CHARACTERS.iter().find(|c| c.id == id)
}

/// Looks up a projectile type by id.
pub fn projectile(id: u8) -> Option<&'static ProjectileDef> {
    PROJECTILES.iter().find(|p| p.id == id)
}

/// Number of playable characters, for validating selections.
pub fn character_count() -> u8 {
    CHARACTERS.len() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ids_match_positions() {
        for (i, def) in PROJECTILES.iter().enumerate() {
            assert_eq!(def.id as usize, i, "{}", def.name);
        }
        for (i, def) in CHARACTERS.iter().enumerate() {
            assert_eq!(def.id as usize, i, "{}", def.name);
        }
    }

    #[test]
    fn every_character_references_known_projectiles() {
        for c in CHARACTERS {
            assert!(projectile(c.primary).is_some(), "{}", c.name);
            assert!(projectile(c.ability_q.projectile).is_some(), "{}", c.name);
            assert!(projectile(c.ability_e.projectile).is_some(), "{}", c.name);
        }
    }

    #[test]
    fn charge_raises_damage_and_range_falloff_lowers_it() {
        let bolt = projectile(PROJ_BOLT).unwrap();
        assert_eq!(bolt.effective_damage(0, 1.0), 10);
        assert_eq!(bolt.effective_damage(100, 1.0), 20);
        assert_eq!(bolt.effective_damage(0, 11.0), 7);
        assert!(bolt.effective_range(100) > bolt.effective_range(0));
        assert_eq!(bolt.effective_range(0), bolt.max_range);
    }

    #[test]
    fn slot_lookup_respects_character_kit() {
        let ranger = character(0).unwrap();
        assert_eq!(ranger.slot_for(PROJ_BOLT), Some(AbilitySlot::Primary));
        assert_eq!(ranger.slot_for(PROJ_PIERCING_LANCE), Some(AbilitySlot::Q));
        assert_eq!(ranger.slot_for(PROJ_GRENADE), None);
        // A teleport E never maps a projectile spawn to the E slot.
        let frost = character(2).unwrap();
        assert_eq!(frost.slot_for(PROJ_FROST_SHARD), Some(AbilitySlot::Primary));
        assert!(frost.teleport_range().is_some());
    }
}
