//! Per-user connection and message rate limiting.
//!
//! Sliding windows over message timestamps, pruned lazily on check rather
//! than eagerly on every insert, so a burst followed by a quiet period
//! correctly re-opens capacity. Every user's counters live behind their own
//! lock: one user hammering the limiter never blocks another user's checks.

use crate::config::RateLimitConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// Typed capacity errors, recoverable by backoff.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("user `{user_id}` already has {active} active connections (limit {limit})")]
    ConnectionLimitExceeded {
        user_id: String,
        active: usize,
        limit: usize,
    },
    #[error("user `{user_id}` exceeded {limit} messages per {window_secs}s")]
    MessageRateExceeded {
        user_id: String,
        limit: u32,
        window_secs: u64,
    },
    #[error("user `{user_id}` exceeded {limit} messages per hour")]
    HourlyRateExceeded { user_id: String, limit: u32 },
}

#[derive(Debug)]
struct UserState {
    connections: HashSet<String>,
    minute_window: VecDeque<Instant>,
    hour_window: VecDeque<Instant>,
    last_activity: Instant,
}

impl UserState {
    fn new() -> Self {
        Self {
            connections: HashSet::new(),
            minute_window: VecDeque::new(),
            hour_window: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn prune(&mut self, short_window: Duration, now: Instant) {
        prune_window(&mut self.minute_window, short_window, now);
        prune_window(&mut self.hour_window, HOUR_WINDOW, now);
    }
}

fn prune_window(window: &mut VecDeque<Instant>, max_age: Duration, now: Instant) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) <= max_age {
            break;
        }
        let _ = window.pop_front();
    }
}

/// Per-user snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRateStats {
    pub active_connections: usize,
    pub messages_in_window: usize,
    pub messages_last_hour: usize,
}

/// Limiter-wide snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub tracked_users: usize,
    pub total_active_connections: usize,
}

/// Sliding-window limiter for connection count and message throughput.
pub struct RateLimiter {
    config: RateLimitConfig,
    users: RwLock<HashMap<String, Arc<Mutex<UserState>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            users: RwLock::new(HashMap::new()),
        }
    }

    fn user_state(&self, user_id: &str) -> Arc<Mutex<UserState>> {
        if let Some(state) = self.users.read().get(user_id) {
            return Arc::clone(state);
        }
        let mut users = self.users.write();
        Arc::clone(
            users
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(UserState::new()))),
        )
    }

    /// Whether the user may open one more connection.
    pub fn check_connection_limit(&self, user_id: &str) -> bool {
        let Some(state) = self.users.read().get(user_id).map(Arc::clone) else {
            return self.config.max_connections_per_user > 0;
        };
        let state = state.lock();
        state.connections.len() < self.config.max_connections_per_user
    }

    /// Register an accepted connection. Registering beyond the per-user
    /// limit fails loudly instead of silently clamping.
    pub fn record_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<(), RateLimitError> {
        let state = self.user_state(user_id);
        let mut state = state.lock();
        if !state.connections.contains(connection_id)
            && state.connections.len() >= self.config.max_connections_per_user
        {
            return Err(RateLimitError::ConnectionLimitExceeded {
                user_id: user_id.to_string(),
                active: state.connections.len(),
                limit: self.config.max_connections_per_user,
            });
        }
        state.connections.insert(connection_id.to_string());
        state.last_activity = Instant::now();
        Ok(())
    }

    pub fn remove_connection(&self, user_id: &str, connection_id: &str) -> bool {
        let Some(state) = self.users.read().get(user_id).map(Arc::clone) else {
            return false;
        };
        let mut state = state.lock();
        let removed = state.connections.remove(connection_id);
        if removed {
            state.last_activity = Instant::now();
        }
        removed
    }

    /// Whether the user has message budget left in both windows.
    pub fn check_message_rate_limit(&self, user_id: &str) -> bool {
        let Some(state) = self.users.read().get(user_id).map(Arc::clone) else {
            return true;
        };
        let mut state = state.lock();
        state.prune(self.short_window(), Instant::now());
        state.minute_window.len() < self.config.max_messages_per_minute as usize
            && state.hour_window.len() < self.config.max_messages_per_hour as usize
    }

    /// Count one inbound message against the user. All message types count
    /// identically.
    pub fn record_message(&self, user_id: &str) -> Result<(), RateLimitError> {
        let state = self.user_state(user_id);
        let mut state = state.lock();
        let now = Instant::now();
        state.prune(self.short_window(), now);

        if state.minute_window.len() >= self.config.max_messages_per_minute as usize {
            return Err(RateLimitError::MessageRateExceeded {
                user_id: user_id.to_string(),
                limit: self.config.max_messages_per_minute,
                window_secs: self.config.message_window_secs,
            });
        }
        if state.hour_window.len() >= self.config.max_messages_per_hour as usize {
            return Err(RateLimitError::HourlyRateExceeded {
                user_id: user_id.to_string(),
                limit: self.config.max_messages_per_hour,
            });
        }

        state.minute_window.push_back(now);
        state.hour_window.push_back(now);
        state.last_activity = now;
        Ok(())
    }

    /// Evict users with no connections and no recent traffic. Returns how
    /// many users were reclaimed.
    pub fn cleanup_inactive_users(&self) -> usize {
        let cutoff = Duration::from_secs(self.config.cleanup_inactive_after_secs);
        let mut users = self.users.write();
        let before = users.len();
        users.retain(|_, state| {
            let state = state.lock();
            !state.connections.is_empty() || state.last_activity.elapsed() < cutoff
        });
        let removed = before - users.len();
        if removed > 0 {
            tracing::debug!(target: "ratelimit", removed, "reclaimed inactive user state");
        }
        removed
    }

    pub fn get_user_stats(&self, user_id: &str) -> Option<UserRateStats> {
        let state = self.users.read().get(user_id).map(Arc::clone)?;
        let mut state = state.lock();
        state.prune(self.short_window(), Instant::now());
        Some(UserRateStats {
            active_connections: state.connections.len(),
            messages_in_window: state.minute_window.len(),
            messages_last_hour: state.hour_window.len(),
        })
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let users = self.users.read();
        RateLimiterStats {
            tracked_users: users.len(),
            total_active_connections: users
                .values()
                .map(|state| state.lock().connections.len())
                .sum(),
        }
    }

    fn short_window(&self) -> Duration {
        Duration::from_secs(self.config.message_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(config)
    }

    #[test]
    fn connection_limit_is_enforced_loudly() {
        let limiter = limiter(RateLimitConfig {
            max_connections_per_user: 2,
            ..RateLimitConfig::default()
        });

        limiter
            .record_connection("alice", "conn-1")
            .expect("first connection fits");
        limiter
            .record_connection("alice", "conn-2")
            .expect("second connection fits");
        assert!(!limiter.check_connection_limit("alice"));

        let error = limiter
            .record_connection("alice", "conn-3")
            .expect_err("third connection must be rejected");
        assert_eq!(
            error,
            RateLimitError::ConnectionLimitExceeded {
                user_id: "alice".to_string(),
                active: 2,
                limit: 2,
            }
        );

        // Re-recording a known connection id is not a new connection.
        limiter
            .record_connection("alice", "conn-1")
            .expect("idempotent re-record must pass");

        assert!(limiter.remove_connection("alice", "conn-1"));
        assert!(limiter.check_connection_limit("alice"));
    }

    #[test]
    fn users_have_independent_message_budgets() {
        let limiter = limiter(RateLimitConfig {
            max_messages_per_minute: 3,
            ..RateLimitConfig::default()
        });

        for _ in 0..3 {
            limiter
                .record_message("alice")
                .expect("alice within budget");
        }
        assert!(!limiter.check_message_rate_limit("alice"));
        limiter
            .record_message("alice")
            .expect_err("alice over budget");

        // Exhausting alice must not cost bob anything.
        assert!(limiter.check_message_rate_limit("bob"));
        for _ in 0..3 {
            limiter.record_message("bob").expect("bob within budget");
        }
    }

    #[test]
    fn window_elapse_reopens_capacity() {
        let limiter = limiter(RateLimitConfig {
            max_messages_per_minute: 2,
            message_window_secs: 1,
            ..RateLimitConfig::default()
        });

        limiter.record_message("alice").expect("within budget");
        limiter.record_message("alice").expect("within budget");
        assert!(!limiter.check_message_rate_limit("alice"));

        std::thread::sleep(Duration::from_millis(1100));
        assert!(
            limiter.check_message_rate_limit("alice"),
            "stale timestamps must be pruned lazily on check"
        );
        limiter
            .record_message("alice")
            .expect("capacity re-opens after the window");
    }

    #[test]
    fn hourly_budget_is_checked_separately() {
        let limiter = limiter(RateLimitConfig {
            max_messages_per_minute: 100,
            max_messages_per_hour: 2,
            ..RateLimitConfig::default()
        });

        limiter.record_message("alice").expect("within budget");
        limiter.record_message("alice").expect("within budget");
        let error = limiter
            .record_message("alice")
            .expect_err("hourly budget exhausted");
        assert_eq!(
            error,
            RateLimitError::HourlyRateExceeded {
                user_id: "alice".to_string(),
                limit: 2,
            }
        );
    }

    #[test]
    fn cleanup_reclaims_only_idle_disconnected_users() {
        let limiter = limiter(RateLimitConfig {
            cleanup_inactive_after_secs: 0,
            ..RateLimitConfig::default()
        });

        limiter.record_message("idle-user").expect("recorded");
        limiter
            .record_connection("connected-user", "conn-1")
            .expect("recorded");

        std::thread::sleep(Duration::from_millis(10));
        let removed = limiter.cleanup_inactive_users();
        assert_eq!(removed, 1);
        assert!(limiter.get_user_stats("idle-user").is_none());
        assert!(
            limiter.get_user_stats("connected-user").is_some(),
            "users with live connections are never reclaimed"
        );
    }

    #[test]
    fn stats_reflect_window_contents() {
        let limiter = limiter(RateLimitConfig::default());
        limiter
            .record_connection("alice", "conn-1")
            .expect("recorded");
        limiter.record_message("alice").expect("recorded");
        limiter.record_message("alice").expect("recorded");

        let stats = limiter.get_user_stats("alice").expect("tracked user");
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.messages_in_window, 2);
        assert_eq!(stats.messages_last_hour, 2);

        let global = limiter.get_stats();
        assert_eq!(global.tracked_users, 1);
        assert_eq!(global.total_active_connections, 1);
    }
}
