//! Per-identity and per-source rate limiting. Packet rates use a two-bucket
//! sliding window (the previous window's count is weighted by its overlap
//! with the sliding interval), connection rates use the same shape over a
//! minute, and authentication failures escalate into an exponential
//! cooldown per source address.
//!
//! Every `allow_*` call both answers and counts, so callers never have to
//! pair a check with a commit.

use protocol::PlayerId;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// Packets per second on the unreliable channel.
const UNRELIABLE_PER_S: u32 = 120;
/// Packets per second on the reliable channel.
const RELIABLE_PER_S: u32 = 40;
/// Reliable packets per second before authentication.
const PREAUTH_PER_S: u32 = 5;
/// New connections per source address per minute.
const CONNECTIONS_PER_MIN: u32 = 5;
/// Auth failures per source before the cooldown starts.
const AUTH_FAILURE_LIMIT: u32 = 5;
/// First cooldown; doubles per further failure up to the cap.
const AUTH_BACKOFF_START_MS: u64 = 30_000;
const AUTH_BACKOFF_CAP_MS: u64 = 3_600_000;
/// Entries untouched this long are dropped by the cleanup pass.
const STALE_AFTER_MS: u64 = 60_000;

/// Two-bucket sliding window counter.
struct Window {
    window_ms: u64,
    window_start: u64,
    current: u32,
    previous: u32,
    touched: u64,
}

impl Window {
    fn new(window_ms: u64, now: u64) -> Window {
        Window {
            window_ms,
            window_start: now,
            current: 0,
            previous: 0,
            touched: now,
        }
    }

    fn roll(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.window_start);
        if elapsed >= 2 * self.window_ms {
            self.previous = 0;
            self.current = 0;
            self.window_start = now;
        } else if elapsed >= self.window_ms {
            self.previous = self.current;
            self.current = 0;
            self.window_start += self.window_ms;
        }
    }

    /// Counts one event iff the sliding estimate stays under the limit.
    fn allow(&mut self, now: u64, limit: u32) -> bool {
        self.roll(now);
        self.touched = now;
        let into_window = now.saturating_sub(self.window_start) as f64 / self.window_ms as f64;
        let estimate = self.previous as f64 * (1.0 - into_window) + self.current as f64;
        if estimate < limit as f64 {
            self.current += 1;
            true
        } else {
            false
        }
    }
}

/// Auth failure tracking with exponential backoff.
struct AuthFailures {
    count: u32,
    cooldown_ms: u64,
    blocked_until: u64,
    touched: u64,
}

#[derive(Default)]
struct Tables {
    unreliable: HashMap<PlayerId, Window>,
    reliable: HashMap<PlayerId, Window>,
    preauth: HashMap<u64, Window>,
    connections: HashMap<IpAddr, Window>,
    auth_failures: HashMap<IpAddr, AuthFailures>,
}

#[derive(Default)]
pub struct RateLimiter {
    tables: Mutex<Tables>,
}

impl RateLimiter {
    pub fn new() -> RateLimiter {
        RateLimiter::default()
    }

    pub fn allow_unreliable(&self, id: PlayerId, now: u64) -> bool {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        tables
            .unreliable
            .entry(id)
            .or_insert_with(|| Window::new(1_000, now))
            .allow(now, UNRELIABLE_PER_S)
    }

    pub fn allow_reliable(&self, id: PlayerId, now: u64) -> bool {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        tables
            .reliable
            .entry(id)
            .or_insert_with(|| Window::new(1_000, now))
            .allow(now, RELIABLE_PER_S)
    }

    /// Reliable traffic on a connection that has not authenticated yet.
    pub fn allow_preauth(&self, conn_id: u64, now: u64) -> bool {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        tables
            .preauth
            .entry(conn_id)
            .or_insert_with(|| Window::new(1_000, now))
            .allow(now, PREAUTH_PER_S)
    }

    /// New-connection gate per source address.
    pub fn allow_connection(&self, source: IpAddr, now: u64) -> bool {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        tables
            .connections
            .entry(source)
            .or_insert_with(|| Window::new(60_000, now))
            .allow(now, CONNECTIONS_PER_MIN)
    }

    /// Whether the source is currently allowed to attempt authentication.
    pub fn auth_allowed(&self, source: IpAddr, now: u64) -> bool {
        let tables = self.tables.lock().expect("rate limiter lock poisoned");
        tables
            .auth_failures
            .get(&source)
            .is_none_or(|f| f.blocked_until <= now)
    }

    /// Records a failed authentication. After the failure limit each
    /// further failure doubles the cooldown, capped at one hour.
    pub fn record_auth_failure(&self, source: IpAddr, now: u64) {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        let entry = tables
            .auth_failures
            .entry(source)
            .or_insert_with(|| AuthFailures {
                count: 0,
                cooldown_ms: AUTH_BACKOFF_START_MS,
                blocked_until: 0,
                touched: now,
            });
        entry.count += 1;
        entry.touched = now;
        if entry.count >= AUTH_FAILURE_LIMIT {
            entry.blocked_until = now + entry.cooldown_ms;
            entry.cooldown_ms = (entry.cooldown_ms * 2).min(AUTH_BACKOFF_CAP_MS);
        }
    }

    /// A successful login clears the failure history of the source.
    pub fn record_auth_success(&self, source: IpAddr) {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        tables.auth_failures.remove(&source);
    }

    /// Drops the pre-auth window of a closed connection.
    pub fn forget_conn(&self, conn_id: u64) {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        tables.preauth.remove(&conn_id);
    }

    /// Background sweep dropping entries untouched for a minute. Auth
    /// failure entries survive while their cooldown still runs.
    pub fn cleanup(&self, now: u64) {
        let mut tables = self.tables.lock().expect("rate limiter lock poisoned");
        let fresh = |touched: u64| now.saturating_sub(touched) <= STALE_AFTER_MS;
        tables.unreliable.retain(|_, w| fresh(w.touched));
        tables.reliable.retain(|_, w| fresh(w.touched));
        tables.preauth.retain(|_, w| fresh(w.touched));
        tables.connections.retain(|_, w| fresh(w.touched));
        tables
            .auth_failures
            .retain(|_, f| fresh(f.touched) || f.blocked_until > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id() -> PlayerId {
        PlayerId(5 << 64)
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
    }

    #[test]
    fn reliable_limit_cuts_off_within_one_window() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;
        let mut allowed = 0;
        for _ in 0..100 {
            if limiter.allow_reliable(id(), now) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 40);
    }

    #[test]
    fn window_recovers_after_it_slides_past() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;
        for _ in 0..40 {
            assert!(limiter.allow_reliable(id(), now));
        }
        assert!(!limiter.allow_reliable(id(), now));
        // Two full windows later the budget is fresh.
        assert!(limiter.allow_reliable(id(), now + 2_000));
    }

    #[test]
    fn preauth_budget_is_much_tighter() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;
        let allowed = (0..20).filter(|_| limiter.allow_preauth(77, now)).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn auth_failures_escalate_into_doubling_cooldowns() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;
        for _ in 0..4 {
            limiter.record_auth_failure(ip(), now);
        }
        assert!(limiter.auth_allowed(ip(), now), "four failures are free");
        limiter.record_auth_failure(ip(), now);
        assert!(!limiter.auth_allowed(ip(), now));
        assert!(limiter.auth_allowed(ip(), now + 30_001));
        // The next failure blocks for a doubled minute.
        limiter.record_auth_failure(ip(), now + 30_001);
        assert!(!limiter.auth_allowed(ip(), now + 30_001 + 59_000));
        assert!(limiter.auth_allowed(ip(), now + 30_001 + 60_001));
    }

    #[test]
    fn success_clears_the_failure_history() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;
        for _ in 0..5 {
            limiter.record_auth_failure(ip(), now);
        }
        assert!(!limiter.auth_allowed(ip(), now));
        limiter.record_auth_success(ip());
        assert!(limiter.auth_allowed(ip(), now));
    }

    #[test]
    fn cleanup_drops_stale_entries_but_keeps_live_cooldowns() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;
        limiter.allow_reliable(id(), now);
        // Seven failures escalate the cooldown to 120 s, past the sweep.
        for _ in 0..7 {
            limiter.record_auth_failure(ip(), now);
        }
        limiter.cleanup(now + STALE_AFTER_MS + 1);
        // The packet window is gone; a fresh one admits again at full rate.
        let allowed = (0..50)
            .filter(|_| limiter.allow_reliable(id(), now + STALE_AFTER_MS + 1))
            .count();
        assert_eq!(allowed, 40);
        // The cooldown outlives the sweep until it expires.
        assert!(!limiter.auth_allowed(ip(), now + STALE_AFTER_MS + 1));
    }
}
