//! Per-connection performance tracking and threshold alerting.
//!
//! Tracks connection establishment latency, per-message latency (client-
//! perceived and server-side), rolling throughput over a configurable
//! window, and on-demand resource samples. Threshold breaches produce
//! retained alerts; the system summary flags connections whose latency
//! deviates significantly from the population.

use crate::config::{PerformanceConfig, PerformanceThresholds};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Latency samples retained per connection.
const MAX_LATENCY_SAMPLES: usize = 1024;
/// Alerts retained per connection (oldest evicted).
const MAX_ALERTS: usize = 256;
/// Mean latency further than this many standard deviations from the
/// population mean marks a connection as an outlier.
const OUTLIER_SIGMA: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// One recorded threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub connection_id: String,
    pub severity: AlertSeverity,
    /// Which threshold was breached, e.g. `"message_latency_ms"`.
    pub metric: String,
    pub measured: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

/// System-wide aggregation over all tracked connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPerfSummary {
    pub connections: usize,
    pub average_latency_ms: f64,
    pub total_alerts: usize,
    /// Connections whose mean latency deviates more than two standard
    /// deviations from the population mean.
    pub outliers: Vec<String>,
}

struct ConnectionPerf {
    established_at: Instant,
    connect_latency_ms: Option<f64>,
    message_timestamps: VecDeque<Instant>,
    client_latencies_ms: VecDeque<f64>,
    server_latencies_ms: VecDeque<f64>,
    memory_mb: Option<f64>,
    cpu_percent: Option<f64>,
    alerts: VecDeque<PerformanceAlert>,
}

impl ConnectionPerf {
    fn new() -> Self {
        Self {
            established_at: Instant::now(),
            connect_latency_ms: None,
            message_timestamps: VecDeque::new(),
            client_latencies_ms: VecDeque::new(),
            server_latencies_ms: VecDeque::new(),
            memory_mb: None,
            cpu_percent: None,
            alerts: VecDeque::new(),
        }
    }

    fn mean_client_latency(&self) -> Option<f64> {
        if self.client_latencies_ms.is_empty() {
            return None;
        }
        Some(self.client_latencies_ms.iter().sum::<f64>() / self.client_latencies_ms.len() as f64)
    }

    fn push_alert(&mut self, alert: PerformanceAlert) {
        if self.alerts.len() >= MAX_ALERTS {
            let _ = self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }
}

fn push_bounded(samples: &mut VecDeque<f64>, value: f64) {
    if samples.len() >= MAX_LATENCY_SAMPLES {
        let _ = samples.pop_front();
    }
    samples.push_back(value);
}

/// Latency/throughput/resource monitor, one entry per connection.
pub struct PerformanceMonitor {
    config: PerformanceConfig,
    inner: Mutex<HashMap<String, ConnectionPerf>>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn thresholds(&self) -> PerformanceThresholds {
        self.config.thresholds
    }

    /// Severity scales with how far past the threshold the measurement is:
    /// double the threshold is critical, anything past it is a warning.
    fn severity_for(measured: f64, threshold: f64) -> AlertSeverity {
        if measured > threshold * 2.0 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }

    fn alert(
        perf: &mut ConnectionPerf,
        connection_id: &str,
        metric: &str,
        measured: f64,
        threshold: f64,
        severity: AlertSeverity,
    ) {
        tracing::warn!(
            target: "perf",
            connection = %connection_id,
            metric,
            measured,
            threshold,
            severity = ?severity,
            "performance threshold breached"
        );
        perf.push_alert(PerformanceAlert {
            connection_id: connection_id.to_string(),
            severity,
            metric: metric.to_string(),
            measured,
            threshold,
            at: Utc::now(),
        });
    }

    /// Record how long the connection took to become usable.
    pub fn record_connection_established(&self, connection_id: &str, latency_ms: f64) {
        let mut inner = self.inner.lock();
        let perf = inner
            .entry(connection_id.to_string())
            .or_insert_with(ConnectionPerf::new);
        perf.connect_latency_ms = Some(latency_ms);

        let threshold = self.config.thresholds.max_connection_time_ms;
        if latency_ms > threshold {
            let severity = Self::severity_for(latency_ms, threshold);
            Self::alert(
                perf,
                connection_id,
                "connection_time_ms",
                latency_ms,
                threshold,
                severity,
            );
        }
    }

    /// Record one delivered message's latency pair.
    pub fn record_message_latency(
        &self,
        connection_id: &str,
        client_latency_ms: f64,
        server_latency_ms: f64,
    ) {
        let thresholds = self.thresholds();
        let mut inner = self.inner.lock();
        let perf = inner
            .entry(connection_id.to_string())
            .or_insert_with(ConnectionPerf::new);
        perf.message_timestamps.push_back(Instant::now());
        push_bounded(&mut perf.client_latencies_ms, client_latency_ms);
        push_bounded(&mut perf.server_latencies_ms, server_latency_ms);

        let threshold = thresholds.max_message_latency_ms;
        if client_latency_ms > threshold {
            let severity = Self::severity_for(client_latency_ms, threshold);
            Self::alert(
                perf,
                connection_id,
                "message_latency_ms",
                client_latency_ms,
                threshold,
                severity,
            );
        }
    }

    /// Record an on-demand resource sample for a connection's task.
    pub fn record_resource_usage(&self, connection_id: &str, memory_mb: f64, cpu_percent: f64) {
        let thresholds = self.thresholds();
        let mut inner = self.inner.lock();
        let perf = inner
            .entry(connection_id.to_string())
            .or_insert_with(ConnectionPerf::new);
        perf.memory_mb = Some(memory_mb);
        perf.cpu_percent = Some(cpu_percent);

        if memory_mb > thresholds.max_memory_mb {
            let severity = Self::severity_for(memory_mb, thresholds.max_memory_mb);
            Self::alert(
                perf,
                connection_id,
                "memory_mb",
                memory_mb,
                thresholds.max_memory_mb,
                severity,
            );
        }
        if cpu_percent > thresholds.max_cpu_percent {
            let severity = Self::severity_for(cpu_percent, thresholds.max_cpu_percent);
            Self::alert(
                perf,
                connection_id,
                "cpu_percent",
                cpu_percent,
                thresholds.max_cpu_percent,
                severity,
            );
        }
    }

    /// Rolling messages/sec over the metrics window. A throughput alert is
    /// only considered once the connection has lived a full window.
    pub fn sample_throughput(&self, connection_id: &str) -> f64 {
        let window = Duration::from_secs(self.config.metrics_window_secs);
        let thresholds = self.thresholds();
        let mut inner = self.inner.lock();
        let Some(perf) = inner.get_mut(connection_id) else {
            return 0.0;
        };

        let now = Instant::now();
        while let Some(front) = perf.message_timestamps.front() {
            if now.duration_since(*front) <= window {
                break;
            }
            let _ = perf.message_timestamps.pop_front();
        }

        let window_secs = self.config.metrics_window_secs.max(1) as f64;
        let throughput = perf.message_timestamps.len() as f64 / window_secs;
        if perf.established_at.elapsed() >= window && throughput < thresholds.min_throughput_per_sec
        {
            Self::alert(
                perf,
                connection_id,
                "throughput_per_sec",
                throughput,
                thresholds.min_throughput_per_sec,
                AlertSeverity::Warning,
            );
        }
        throughput
    }

    pub fn alerts_for(&self, connection_id: &str) -> Vec<PerformanceAlert> {
        self.inner
            .lock()
            .get(connection_id)
            .map(|perf| perf.alerts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_alerts(&self) -> Vec<PerformanceAlert> {
        self.inner
            .lock()
            .values()
            .flat_map(|perf| perf.alerts.iter().cloned())
            .collect()
    }

    pub fn remove_connection(&self, connection_id: &str) -> bool {
        self.inner.lock().remove(connection_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Aggregate view with outlier identification.
    pub fn get_system_summary(&self) -> SystemPerfSummary {
        let inner = self.inner.lock();
        let means: Vec<(String, f64)> = inner
            .iter()
            .filter_map(|(id, perf)| perf.mean_client_latency().map(|mean| (id.clone(), mean)))
            .collect();
        let total_alerts = inner.values().map(|perf| perf.alerts.len()).sum();

        if means.is_empty() {
            return SystemPerfSummary {
                connections: inner.len(),
                average_latency_ms: 0.0,
                total_alerts,
                outliers: Vec::new(),
            };
        }

        let population_mean =
            means.iter().map(|(_, mean)| mean).sum::<f64>() / means.len() as f64;
        let variance = means
            .iter()
            .map(|(_, mean)| (mean - population_mean).powi(2))
            .sum::<f64>()
            / means.len() as f64;
        let stddev = variance.sqrt();

        let mut outliers: Vec<String> = means
            .iter()
            .filter(|(_, mean)| {
                stddev > 0.0 && (mean - population_mean).abs() > OUTLIER_SIGMA * stddev
            })
            .map(|(id, _)| id.clone())
            .collect();
        outliers.sort();

        SystemPerfSummary {
            connections: inner.len(),
            average_latency_ms: population_mean,
            total_alerts,
            outliers,
        }
    }
}
