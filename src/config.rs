//! Runtime configuration for the relay core.
//!
//! Every component takes its tunables from one of these structs. All fields
//! have serde defaults so a partial config file (or an empty table) always
//! deserializes to something usable.

use serde::{Deserialize, Serialize};

/// Limits and tunables for one per-connection message queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueLimits {
    /// Maximum buffered messages across all priority buckets.
    pub max_size: usize,
    /// Buffered messages older than this are discarded at flush time.
    pub max_message_age_secs: u64,
    /// Delivery attempts per message before it is discarded.
    pub max_attempts: u32,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_message_age_secs: 300,
            max_attempts: 3,
        }
    }
}

/// Per-user connection and message rate limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Simultaneous WebSocket connections allowed per user.
    pub max_connections_per_user: usize,
    /// Messages allowed per sliding window.
    pub max_messages_per_minute: u32,
    /// Messages allowed per rolling hour.
    pub max_messages_per_hour: u32,
    /// Length of the short sliding window in seconds.
    pub message_window_secs: u64,
    /// Users with no connections and no traffic for this long are evicted.
    pub cleanup_inactive_after_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 3,
            max_messages_per_minute: 60,
            max_messages_per_hour: 1000,
            message_window_secs: 60,
            cleanup_inactive_after_secs: 3600,
        }
    }
}

/// Session tracking tunables for the agent event monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventMonitorConfig {
    /// Sessions that have not completed within this window can be flagged
    /// timed-out.
    pub session_timeout_secs: u64,
    /// Completed trackers older than this are reclaimed by cleanup.
    pub completed_retention_secs: u64,
}

impl Default for EventMonitorConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 1800,
            completed_retention_secs: 3600,
        }
    }
}

/// Alerting thresholds for per-connection performance tracking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceThresholds {
    /// Client-perceived per-message latency above this raises an alert.
    pub max_message_latency_ms: f64,
    /// Connection establishment time above this raises an alert.
    pub max_connection_time_ms: f64,
    /// Rolling throughput below this raises a warning once the window filled.
    pub min_throughput_per_sec: f64,
    /// Sampled memory above this raises an alert.
    pub max_memory_mb: f64,
    /// Sampled CPU above this raises an alert.
    pub max_cpu_percent: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_message_latency_ms: 1000.0,
            max_connection_time_ms: 5000.0,
            min_throughput_per_sec: 0.1,
            max_memory_mb: 512.0,
            max_cpu_percent: 80.0,
        }
    }
}

/// Performance monitor tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Rolling window used for throughput computation.
    pub metrics_window_secs: u64,
    pub thresholds: PerformanceThresholds,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            metrics_window_secs: 300,
            thresholds: PerformanceThresholds::default(),
        }
    }
}

/// Top-level configuration aggregating every component's tunables.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub queue: QueueLimits,
    pub rate_limit: RateLimitConfig,
    pub events: EventMonitorConfig,
    pub performance: PerformanceConfig,
}
