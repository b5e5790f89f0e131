//! The persistent credential store: accounts with salted password hashes,
//! ELO, match records and the deterministic username-to-identity mapping.
//! Runs on SQLite; the only hot-path calls are authentication, ELO reads
//! and the end-of-match write, so every query goes straight to the pool.

use chrono::Utc;
use protocol::PlayerId;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

/// Domain separator of the identity hash. Changing it invalidates every
/// persisted match record.
const IDENTITY_SALT: &str = "gamesalt:";

/// Starting rating for fresh accounts.
pub const DEFAULT_ELO: i64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One row of a player's match history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub map_index: u8,
    pub duration_min: u8,
    pub kills: u32,
    pub deaths: u32,
    pub rank: u16,
    pub played_at: i64,
}

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardRow {
    pub username: String,
    pub elo: i64,
    pub wins: u32,
    pub matches: u32,
}

/// The deterministic identity of an account: the leading 128 bits of
/// `SHA-256("gamesalt:" || lowercase(username))`. Stable across versions
/// and collision resistant, so the same name always resolves to the same
/// identity.
pub fn identifier_for(username: &str) -> PlayerId {
    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_SALT.as_bytes());
    hasher.update(username.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest[..16]);
    PlayerId(u128::from_be_bytes(raw))
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn id_text(id: PlayerId) -> String {
    format!("{id}")
}

pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    /// Opens (and creates if missing) the store at the path and applies the
    /// schema.
    pub async fn open(path: &str) -> Result<CredentialStore, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(StoreError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = CredentialStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<CredentialStore, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = CredentialStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (
                username TEXT PRIMARY KEY,
                player_id TEXT NOT NULL UNIQUE,
                pass_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                map_index INTEGER NOT NULL,
                duration_min INTEGER NOT NULL,
                played_at INTEGER NOT NULL,
                player_count INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS match_results (
                match_id INTEGER NOT NULL REFERENCES matches(id),
                player_id TEXT NOT NULL,
                kills INTEGER NOT NULL,
                deaths INTEGER NOT NULL,
                rank INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        // ELO arrived after the first schema; adding the column is a no-op
        // on stores that already have it.
        let _ = sqlx::query(
            "ALTER TABLE accounts ADD COLUMN elo INTEGER NOT NULL DEFAULT 1000",
        )
        .execute(&self.pool)
        .await;
        Ok(())
    }

    /// Creates an account. Returns false when the name is taken.
    pub async fn register(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let username = username.to_lowercase();
        let mut salt_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex(&salt_bytes);
        let pass_hash = hash_password(&salt, password);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO accounts
                (username, player_id, pass_hash, salt, created_at, elo)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&username)
        .bind(id_text(identifier_for(&username)))
        .bind(pass_hash)
        .bind(salt)
        .bind(Utc::now().timestamp())
        .bind(DEFAULT_ELO)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Verifies a username/password pair.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let username = username.to_lowercase();
        let row = sqlx::query("SELECT pass_hash, salt FROM accounts WHERE username = ?")
            .bind(&username)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let stored: String = row.get("pass_hash");
        let salt: String = row.get("salt");
        Ok(hash_password(&salt, password) == stored)
    }

    /// The stored rating, or the default for unknown identities.
    pub async fn elo(&self, id: PlayerId) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT elo FROM accounts WHERE player_id = ?")
            .bind(id_text(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("elo")).unwrap_or(DEFAULT_ELO))
    }

    pub async fn update_elo(&self, id: PlayerId, elo: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET elo = ? WHERE player_id = ?")
            .bind(elo)
            .bind(id_text(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persists one finished match and its per-player results in a single
    /// transaction. The caller filters bots out beforehand.
    pub async fn save_match(
        &self,
        map_index: u8,
        duration_min: u8,
        results: &[(PlayerId, u32, u32, u16)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO matches (map_index, duration_min, played_at, player_count)
             VALUES (?, ?, ?, ?)",
        )
        .bind(map_index as i64)
        .bind(duration_min as i64)
        .bind(Utc::now().timestamp())
        .bind(results.len() as i64)
        .execute(&mut tx)
        .await?;
        let match_id = inserted.last_insert_rowid();
        for (id, kills, deaths, rank) in results {
            sqlx::query(
                "INSERT INTO match_results (match_id, player_id, kills, deaths, rank)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(match_id)
            .bind(id_text(*id))
            .bind(*kills as i64)
            .bind(*deaths as i64)
            .bind(*rank as i64)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The most recent matches of one player, newest first.
    pub async fn match_history(
        &self,
        id: PlayerId,
        limit: u32,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT m.map_index, m.duration_min, r.kills, r.deaths, r.rank, m.played_at
             FROM match_results r JOIN matches m ON m.id = r.match_id
             WHERE r.player_id = ?
             ORDER BY m.played_at DESC, m.id DESC
             LIMIT ?",
        )
        .bind(id_text(id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| HistoryRow {
                map_index: row.get::<i64, _>("map_index") as u8,
                duration_min: row.get::<i64, _>("duration_min") as u8,
                kills: row.get::<i64, _>("kills") as u32,
                deaths: row.get::<i64, _>("deaths") as u32,
                rank: row.get::<i64, _>("rank") as u16,
                played_at: row.get("played_at"),
            })
            .collect())
    }

    /// Lifetime totals of one player: matches played and rank-one
    /// finishes.
    pub async fn stats(&self, id: PlayerId) -> Result<(u32, u32), StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS played, COALESCE(SUM(rank = 1), 0) AS wins
             FROM match_results WHERE player_id = ?",
        )
        .bind(id_text(id))
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get::<i64, _>("played") as u32,
            row.get::<i64, _>("wins") as u32,
        ))
    }

    /// Top accounts by rating.
    pub async fn leaderboard(&self, limit: u32) -> Result<Vec<BoardRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT a.username, a.elo,
                    COALESCE(SUM(r.rank = 1), 0) AS wins,
                    COUNT(r.match_id) AS matches
             FROM accounts a LEFT JOIN match_results r ON r.player_id = a.player_id
             GROUP BY a.username, a.elo
             ORDER BY a.elo DESC, a.username ASC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| BoardRow {
                username: row.get("username"),
                elo: row.get("elo"),
                wins: row.get::<i64, _>("wins") as u32,
                matches: row.get::<i64, _>("matches") as u32,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_deterministic_and_case_insensitive() {
        let a = identifier_for("Moira");
        let b = identifier_for("moira");
        let c = identifier_for("moirb");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_bot(), "account identities never land in bot range");
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        assert!(store.register("moira", "sekrit").await.unwrap());
        assert!(!store.register("Moira", "other").await.unwrap(), "name taken");
        assert!(store.authenticate("moira", "sekrit").await.unwrap());
        assert!(!store.authenticate("moira", "wrong").await.unwrap());
        assert!(!store.authenticate("nobody", "sekrit").await.unwrap());
    }

    #[tokio::test]
    async fn elo_defaults_and_updates() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store.register("kess", "pw").await.unwrap();
        let id = identifier_for("kess");
        assert_eq!(store.elo(id).await.unwrap(), DEFAULT_ELO);
        store.update_elo(id, 1234).await.unwrap();
        assert_eq!(store.elo(id).await.unwrap(), 1234);
        // Unknown identities read as the default.
        assert_eq!(store.elo(identifier_for("ghost")).await.unwrap(), DEFAULT_ELO);
    }

    #[tokio::test]
    async fn match_write_is_queryable_from_history_and_stats() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store.register("ada", "pw").await.unwrap();
        store.register("bel", "pw").await.unwrap();
        let ada = identifier_for("ada");
        let bel = identifier_for("bel");
        store
            .save_match(1, 5, &[(ada, 7, 2, 1), (bel, 2, 7, 2)])
            .await
            .unwrap();
        store
            .save_match(0, 3, &[(ada, 1, 4, 2), (bel, 4, 1, 1)])
            .await
            .unwrap();

        let history = store.match_history(ada, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].map_index, 0, "newest first");
        let (played, wins) = store.stats(ada).await.unwrap();
        assert_eq!((played, wins), (2, 1));
    }

    #[tokio::test]
    async fn leaderboard_orders_by_elo() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store.register("low", "pw").await.unwrap();
        store.register("high", "pw").await.unwrap();
        store.update_elo(identifier_for("high"), 1500).await.unwrap();
        let board = store.leaderboard(10).await.unwrap();
        assert_eq!(board[0].username, "high");
        assert_eq!(board[0].elo, 1500);
        assert_eq!(board[1].username, "low");
    }
}
