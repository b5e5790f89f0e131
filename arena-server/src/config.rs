//! The server configuration. Loaded from `ServerConfig.json` next to the
//! binary if present, otherwise every field falls back to its default. This
//! mirrors the way the relay reads its game list: a plain JSON file that an
//! operator can edit without recompiling.

use serde::Deserialize;
use std::path::Path;

/// All tunables of the server in one place. Timings are milliseconds unless
/// the field name says otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Port for both the TCP and the UDP endpoint.
    pub port: u16,
    /// Period of the projectile tick.
    pub projectile_speed_ms: u64,
    /// Period of the item spawn task.
    pub item_spawn_interval_ms: u64,
    /// Period of the remaining-time broadcast, in seconds.
    pub time_sync_interval_s: u64,
    /// Delay between a kill and the victim's respawn.
    pub respawn_delay_ms: u64,
    /// How often clients are expected to send heartbeats.
    pub heartbeat_interval_ms: u64,
    /// A client whose last heartbeat is older than this is dropped.
    pub client_timeout_ms: u64,
    /// Reference interval for the movement speed gate.
    pub move_rate_limit_ms: u64,
    /// Cooldown between two primary-fire projectiles.
    pub shoot_cooldown_ms: u64,
    /// Maximum number of items a player can carry.
    pub inventory_cap: usize,
    /// Hard upper bound on players per lobby.
    pub max_lobby_players: u8,
    /// Cooldown before the same host may create another lobby.
    pub lobby_create_cooldown_ms: u64,
    /// Period of the matchmaking pass, in seconds.
    pub matchmaking_tick_s: u64,
    /// A queue entry older than this forms a match below capacity, seconds.
    pub queue_age_limit_s: u64,
    /// Duration of a shield pickup.
    pub shield_duration_ms: u64,
    /// Duration of a gem boost pickup.
    pub gem_duration_ms: u64,
    /// Path of the SQLite credential store.
    pub database_path: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: protocol::SERVER_PORT,
            projectile_speed_ms: 50,
            item_spawn_interval_ms: 10_000,
            time_sync_interval_s: 5,
            respawn_delay_ms: 3_000,
            heartbeat_interval_ms: 2_000,
            client_timeout_ms: 15_000,
            move_rate_limit_ms: 100,
            shoot_cooldown_ms: 500,
            inventory_cap: 3,
            max_lobby_players: 8,
            lobby_create_cooldown_ms: 5_000,
            matchmaking_tick_s: 5,
            queue_age_limit_s: 60,
            shield_duration_ms: 5_000,
            gem_duration_ms: 8_000,
            database_path: "arena.db".into(),
        }
    }
}

impl ServerConfig {
    /// Reads the configuration file, falling back to defaults when the file
    /// is missing. A present but malformed file is an error so that a typo
    /// does not silently run the server with defaults.
    pub fn load(path: &Path) -> Result<ServerConfig, String> {
        if !path.exists() {
            return Ok(ServerConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/ServerConfig.json")).unwrap();
        assert_eq!(config.port, protocol::SERVER_PORT);
        assert_eq!(config.projectile_speed_ms, 50);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let parsed: ServerConfig = serde_json::from_str(r#"{"port": 9999}"#).unwrap();
        assert_eq!(parsed.port, 9999);
        assert_eq!(parsed.inventory_cap, 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<ServerConfig>(r#"{"prot": 1}"#).is_err());
    }
}
