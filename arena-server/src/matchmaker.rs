//! The ranked queue. Players enter with their rating and character choice;
//! a periodic pass forms a match either when enough players queue (taking
//! the tightest rating window) or when the oldest entry has waited long
//! enough to play against whoever is around, topped up with bots.

use protocol::PlayerId;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: PlayerId,
    pub character_id: u8,
    pub elo: i64,
    pub joined_at: u64,
}

/// A queued player's view: position and wait so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub id: PlayerId,
    pub position: u16,
    pub queue_size: u16,
    pub waited_s: u32,
    pub elo: i64,
}

#[derive(Default)]
pub struct Matchmaker {
    queue: Mutex<Vec<QueueEntry>>,
}

impl Matchmaker {
    pub fn new() -> Matchmaker {
        Matchmaker::default()
    }

    /// Enqueues a player; re-joining just refreshes character and rating,
    /// keeping the original wait position.
    pub async fn join(&self, id: PlayerId, character_id: u8, elo: i64, now: u64) -> usize {
        let mut queue = self.queue.lock().await;
        if let Some(entry) = queue.iter_mut().find(|e| e.id == id) {
            entry.character_id = character_id;
            entry.elo = elo;
        } else {
            queue.push(QueueEntry {
                id,
                character_id,
                elo,
                joined_at: now,
            });
        }
        queue.len()
    }

    pub async fn leave(&self, id: PlayerId) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|e| e.id != id);
        queue.len() != before
    }

    pub async fn change_character(&self, id: PlayerId, character_id: u8) -> bool {
        let mut queue = self.queue.lock().await;
        if let Some(entry) = queue.iter_mut().find(|e| e.id == id) {
            entry.character_id = character_id;
            true
        } else {
            false
        }
    }

    pub async fn contains(&self, id: PlayerId) -> bool {
        self.queue.lock().await.iter().any(|e| e.id == id)
    }

    /// One matchmaking pass over a queue snapshot. At capacity the
    /// ELO-sorted window with the smallest spread is taken; below capacity
    /// a match forms once the oldest entry has aged out and at least two
    /// players wait. The chosen entries leave the queue atomically.
    pub async fn take_match(
        &self,
        max_players: usize,
        age_limit_ms: u64,
        now: u64,
    ) -> Option<Vec<QueueEntry>> {
        let mut queue = self.queue.lock().await;
        if queue.len() >= max_players {
            let mut by_elo = queue.clone();
            by_elo.sort_by_key(|e| e.elo);
            let mut best_start = 0;
            let mut best_spread = i64::MAX;
            for start in 0..=(by_elo.len() - max_players) {
                let spread = by_elo[start + max_players - 1].elo - by_elo[start].elo;
                if spread < best_spread {
                    best_spread = spread;
                    best_start = start;
                }
            }
            let chosen: Vec<QueueEntry> =
                by_elo[best_start..best_start + max_players].to_vec();
            queue.retain(|e| !chosen.iter().any(|c| c.id == e.id));
            return Some(chosen);
        }

        let oldest = queue.iter().map(|e| e.joined_at).min()?;
        if queue.len() >= 2 && now.saturating_sub(oldest) > age_limit_ms {
            let chosen: Vec<QueueEntry> = queue.drain(..).collect();
            return Some(chosen);
        }
        None
    }

    /// Status rows for everyone still waiting.
    pub async fn status(&self, now: u64) -> Vec<QueueStatus> {
        let queue = self.queue.lock().await;
        let size = queue.len() as u16;
        queue
            .iter()
            .enumerate()
            .map(|(i, e)| QueueStatus {
                id: e.id,
                position: (i + 1) as u16,
                queue_size: size,
                waited_s: (now.saturating_sub(e.joined_at) / 1000) as u32,
                elo: e.elo,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> PlayerId {
        PlayerId(n | 1 << 64)
    }

    #[tokio::test]
    async fn capacity_match_takes_the_tightest_elo_window() {
        let mm = Matchmaker::new();
        let elos = [(1u128, 900), (2, 1000), (3, 1050), (4, 1500), (5, 2000)];
        for (n, elo) in elos {
            mm.join(id(n), 0, elo, 0).await;
        }
        let chosen = mm.take_match(3, 60_000, 1).await.unwrap();
        let mut ids: Vec<PlayerId> = chosen.iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec![id(1), id(2), id(3)], "900..1050 is the tightest");
        // The two outliers stay queued.
        assert_eq!(mm.status(1).await.len(), 2);
    }

    #[tokio::test]
    async fn aged_queue_matches_below_capacity() {
        let mm = Matchmaker::new();
        mm.join(id(1), 0, 1000, 0).await;
        mm.join(id(2), 1, 1200, 10_000).await;
        assert!(mm.take_match(8, 60_000, 30_000).await.is_none());
        let chosen = mm.take_match(8, 60_000, 61_000).await.unwrap();
        assert_eq!(chosen.len(), 2);
        assert!(mm.status(61_000).await.is_empty());
    }

    #[tokio::test]
    async fn a_lone_player_never_matches() {
        let mm = Matchmaker::new();
        mm.join(id(1), 0, 1000, 0).await;
        assert!(mm.take_match(8, 60_000, 120_000).await.is_none());
    }

    #[tokio::test]
    async fn leave_and_rejoin_keep_the_queue_consistent() {
        let mm = Matchmaker::new();
        mm.join(id(1), 0, 1000, 0).await;
        mm.join(id(2), 0, 1100, 100).await;
        assert!(mm.leave(id(1)).await);
        assert!(!mm.leave(id(1)).await);
        // Rejoining updates rather than duplicates.
        mm.join(id(2), 3, 1150, 5_000).await;
        let status = mm.status(10_000).await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].waited_s, 9, "original join time is kept");
        assert!(mm.change_character(id(2), 1).await);
    }
}
