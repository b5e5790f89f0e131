//! Per-player kill and death counters with scoreboard ordering. Counters
//! are atomics so the projectile tick and burn pulses can record from
//! anywhere without a lock.

use protocol::PlayerId;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
struct Score {
    kills: AtomicU32,
    deaths: AtomicU32,
}

/// One scoreboard row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreRow {
    pub id: PlayerId,
    pub kills: u32,
    pub deaths: u32,
}

/// Aggregated team standing, one rank per team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamRow {
    pub team_id: u8,
    pub kills: u32,
    pub deaths: u32,
    pub rank: u16,
}

#[derive(Default)]
pub struct KillTracker {
    scores: RwLock<HashMap<PlayerId, Score>>,
}

impl KillTracker {
    pub fn new() -> KillTracker {
        KillTracker::default()
    }

    /// Registers a participant so they appear on the scoreboard even with
    /// zero kills.
    pub fn track(&self, id: PlayerId) {
        self.scores
            .write()
            .expect("score lock poisoned")
            .entry(id)
            .or_default();
    }

    /// Records one kill: the killer's kill counter and the victim's death
    /// counter both advance.
    pub fn record_kill(&self, killer: PlayerId, victim: PlayerId) {
        let scores = self.scores.read().expect("score lock poisoned");
        if let Some(score) = scores.get(&killer) {
            score.kills.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(score) = scores.get(&victim) {
            score.deaths.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn kills_of(&self, id: PlayerId) -> u32 {
        self.scores
            .read()
            .expect("score lock poisoned")
            .get(&id)
            .map(|s| s.kills.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn deaths_of(&self, id: PlayerId) -> u32 {
        self.scores
            .read()
            .expect("score lock poisoned")
            .get(&id)
            .map(|s| s.deaths.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Scoreboard ordered by kills descending; ties keep insertion-agnostic
    /// stable order by identity so repeated reads agree.
    pub fn scoreboard(&self) -> Vec<ScoreRow> {
        let mut rows: Vec<ScoreRow> = self
            .scores
            .read()
            .expect("score lock poisoned")
            .iter()
            .map(|(id, score)| ScoreRow {
                id: *id,
                kills: score.kills.load(Ordering::Acquire),
                deaths: score.deaths.load(Ordering::Acquire),
            })
            .collect();
        rows.sort_by_key(|row| row.id);
        rows.sort_by(|a, b| b.kills.cmp(&a.kills));
        rows
    }

    /// Team totals with one rank per team, best kill count first.
    pub fn team_scoreboard(&self, teams: &HashMap<PlayerId, u8>) -> Vec<TeamRow> {
        let mut totals: HashMap<u8, (u32, u32)> = HashMap::new();
        for row in self.scoreboard() {
            let Some(team) = teams.get(&row.id) else {
                continue;
            };
            let entry = totals.entry(*team).or_default();
            entry.0 += row.kills;
            entry.1 += row.deaths;
        }
        let mut rows: Vec<TeamRow> = totals
            .into_iter()
            .map(|(team_id, (kills, deaths))| TeamRow {
                team_id,
                kills,
                deaths,
                rank: 0,
            })
            .collect();
        rows.sort_by_key(|row| row.team_id);
        rows.sort_by(|a, b| b.kills.cmp(&a.kills));
        for (i, row) in rows.iter_mut().enumerate() {
            row.rank = (i + 1) as u16;
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> PlayerId {
        PlayerId(n | 1 << 64)
    }

    #[test]
    fn kill_advances_both_counters() {
        let tracker = KillTracker::new();
        tracker.track(id(1));
        tracker.track(id(2));
        tracker.record_kill(id(1), id(2));
        assert_eq!(tracker.kills_of(id(1)), 1);
        assert_eq!(tracker.deaths_of(id(2)), 1);
        assert_eq!(tracker.deaths_of(id(1)), 0);
    }

    #[test]
    fn scoreboard_orders_by_kills_descending() {
        let tracker = KillTracker::new();
        for n in 1..=3 {
            tracker.track(id(n));
        }
        tracker.record_kill(id(2), id(1));
        tracker.record_kill(id(2), id(3));
        tracker.record_kill(id(3), id(1));
        let rows = tracker.scoreboard();
        assert_eq!(rows[0].id, id(2));
        assert_eq!(rows[0].kills, 2);
        assert_eq!(rows[1].id, id(3));
        assert_eq!(rows[2].deaths, 2);
    }

    #[test]
    fn team_scoreboard_assigns_one_rank_per_team() {
        let tracker = KillTracker::new();
        for n in 1..=4 {
            tracker.track(id(n));
        }
        let teams: HashMap<PlayerId, u8> =
            [(id(1), 1), (id(2), 1), (id(3), 2), (id(4), 2)].into();
        tracker.record_kill(id(3), id(1));
        tracker.record_kill(id(4), id(2));
        tracker.record_kill(id(1), id(3));
        let rows = tracker.team_scoreboard(&teams);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].team_id, 2);
        assert_eq!(rows[0].kills, 2);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].rank, 2);
    }
}
