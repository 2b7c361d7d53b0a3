//! Per-connection priority message queue.
//!
//! While a connection is being set up the queue buffers outbound messages in
//! four priority buckets (FIFO within each bucket). Once the connection's
//! state machine reports an operational state the queue switches to
//! pass-through, drains the backlog, and from then on hands messages straight
//! to the registered processor. A failed connection closes the queue.

pub mod registry;

use crate::config::QueueLimits;
use crate::connection::{ConnectionState, ConnectionStateMachine, StateObserver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ── Priorities ───────────────────────────────────────────────────────────

/// Delivery priority of a queued message. `Critical` outranks everything and
/// is never evicted to make room for lower-priority traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub const COUNT: usize = 4;

    /// Bucket index; higher index = higher priority.
    fn index(self) -> usize {
        self as usize
    }
}

// ── QueuedMessage ────────────────────────────────────────────────────────

/// One buffered unit of outbound work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_data: Value,
    pub message_type: String,
    pub priority: MessagePriority,
    pub message_id: String,
    pub user_id: Option<String>,
    pub connection_id: Option<String>,
    /// Set at creation, never updated.
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Set by the first `mark_attempt` only.
    pub processing_started_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    pub fn new(
        message_data: Value,
        message_type: impl Into<String>,
        priority: MessagePriority,
        message_id: Option<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            message_data,
            message_type: message_type.into(),
            priority,
            message_id: message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: None,
            connection_id: None,
            queued_at: Utc::now(),
            attempts: 0,
            max_attempts,
            last_attempt: None,
            processing_started_at: None,
        }
    }

    /// Record one delivery attempt. The first attempt pins
    /// `processing_started_at`; every attempt bumps `last_attempt`.
    pub fn mark_attempt(&mut self) {
        let now = Utc::now();
        self.attempts += 1;
        self.last_attempt = Some(now);
        if self.processing_started_at.is_none() {
            self.processing_started_at = Some(now);
        }
    }

    /// Time spent buffered before the first delivery attempt. Zero when the
    /// message was never attempted.
    pub fn queue_duration(&self) -> Duration {
        self.processing_started_at
            .map(|started| {
                started
                    .signed_duration_since(self.queued_at)
                    .to_std()
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.queued_at);
        match chrono::Duration::from_std(max_age) {
            Ok(limit) => age > limit,
            Err(_) => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

// ── Processor seam ───────────────────────────────────────────────────────

/// Async delivery sink for dequeued messages. In production this wraps the
/// transport's `send_json`; tests plug in recording fakes.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &QueuedMessage) -> anyhow::Result<()>;
}

// ── Queue state ──────────────────────────────────────────────────────────

/// Delivery mode of a queue, driven by the connection's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Messages accumulate without delivery (connection setup).
    Buffering,
    /// Messages bypass buffering and are delivered immediately.
    PassThrough,
    /// Terminal. Every enqueue fails.
    Closed,
}

/// Operational counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub messages_expired: u64,
    pub messages_flushed: u64,
    pub messages_failed: u64,
    pub flush_operations: u64,
    pub overflow_events: u64,
    pub peak_queue_size: usize,
}

/// Read-only snapshot returned by [`MessageQueue::get_queue_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub connection_id: String,
    pub user_id: String,
    pub mode: QueueMode,
    pub total_size: usize,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub metrics: QueueMetrics,
    pub average_queue_duration_ms: f64,
}

struct QueueState {
    mode: QueueMode,
    /// Indexed by `MessagePriority::index()`; FIFO within each bucket.
    buckets: [VecDeque<QueuedMessage>; MessagePriority::COUNT],
    metrics: QueueMetrics,
    duration_total_ms: f64,
    duration_samples: u64,
    flush_in_progress: bool,
    last_flush_ok: bool,
}

impl QueueState {
    fn total_size(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Next message in delivery order: priority rank descending, FIFO within
    /// a bucket.
    fn pop_next(&mut self) -> Option<QueuedMessage> {
        for bucket in self.buckets.iter_mut().rev() {
            if let Some(message) = bucket.pop_front() {
                return Some(message);
            }
        }
        None
    }

    fn record_queue_duration(&mut self, message: &QueuedMessage) {
        self.duration_total_ms += message.queue_duration().as_secs_f64() * 1000.0;
        self.duration_samples += 1;
    }
}

// ── MessageQueue ─────────────────────────────────────────────────────────

/// Priority message queue for a single connection.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct MessageQueue {
    connection_id: String,
    user_id: String,
    limits: QueueLimits,
    machine: Arc<ConnectionStateMachine>,
    inner: Arc<Mutex<QueueState>>,
    processor: Arc<Mutex<Option<Arc<dyn MessageProcessor>>>>,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl MessageQueue {
    /// Create a queue wired to its connection's state machine. The queue
    /// registers itself as a state observer; `close` unregisters it.
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        limits: QueueLimits,
        machine: Arc<ConnectionStateMachine>,
    ) -> Self {
        let queue = Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            limits,
            machine,
            inner: Arc::new(Mutex::new(QueueState {
                mode: QueueMode::Buffering,
                buckets: std::array::from_fn(|_| VecDeque::new()),
                metrics: QueueMetrics::default(),
                duration_total_ms: 0.0,
                duration_samples: 0,
                flush_in_progress: false,
                last_flush_ok: true,
            })),
            processor: Arc::new(Mutex::new(None)),
        };
        queue
            .machine
            .add_observer(queue.observer_id(), Arc::new(queue.clone()));
        queue
    }

    fn observer_id(&self) -> String {
        format!("queue:{}", self.connection_id)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn mode(&self) -> QueueMode {
        self.inner.lock().mode
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size()
    }

    /// Replace the delivery sink. Takes effect on the next flush or
    /// pass-through enqueue.
    pub fn set_message_processor(&self, processor: Arc<dyn MessageProcessor>) {
        *self.processor.lock() = Some(processor);
    }

    /// Enqueue an outbound message.
    ///
    /// Returns false when the queue is closed, when the message was dropped
    /// by overflow policy, or when pass-through delivery failed. In
    /// pass-through mode with a registered processor the message is delivered
    /// inside this call and never buffered.
    pub async fn enqueue_message(
        &self,
        message_data: Value,
        message_type: &str,
        priority: MessagePriority,
        message_id: Option<String>,
    ) -> bool {
        let mut message = QueuedMessage::new(
            message_data,
            message_type,
            priority,
            message_id,
            self.limits.max_attempts,
        );
        message.user_id = Some(self.user_id.clone());
        message.connection_id = Some(self.connection_id.clone());

        let pass_through_processor = {
            let mut state = self.inner.lock();
            match state.mode {
                QueueMode::Closed => return false,
                QueueMode::PassThrough => {
                    let processor = self.processor.lock().clone();
                    match processor {
                        Some(processor) => {
                            state.metrics.messages_queued += 1;
                            Some(processor)
                        }
                        // No sink yet: buffer so nothing is lost; the next
                        // flush after set_message_processor drains it.
                        None => {
                            return self.buffer_message(&mut state, message);
                        }
                    }
                }
                QueueMode::Buffering => {
                    return self.buffer_message(&mut state, message);
                }
            }
        };

        // Pass-through delivery happens outside the queue lock.
        if let Some(processor) = pass_through_processor {
            message.mark_attempt();
            let delivered = processor.process(&message).await;
            let mut state = self.inner.lock();
            state.record_queue_duration(&message);
            match delivered {
                Ok(()) => {
                    state.metrics.messages_flushed += 1;
                    true
                }
                Err(error) => {
                    state.metrics.messages_failed += 1;
                    tracing::debug!(
                        target: "queue",
                        connection = %self.connection_id,
                        message_type = %message.message_type,
                        "pass-through delivery failed: {error}"
                    );
                    false
                }
            }
        } else {
            true
        }
    }

    /// Insert into the priority bucket, applying overflow policy at capacity.
    /// Caller holds the queue lock. Returns whether the message was kept.
    fn buffer_message(&self, state: &mut QueueState, message: QueuedMessage) -> bool {
        let incoming = message.priority.index();
        if state.total_size() >= self.limits.max_size {
            // Evict the oldest message from the lowest non-empty bucket that
            // is strictly lower priority than the incoming message. With no
            // such victim the incoming message itself is dropped; residents
            // of equal or higher priority are never displaced.
            let victim = (0..incoming).find(|&rank| !state.buckets[rank].is_empty());
            state.metrics.messages_dropped += 1;
            state.metrics.overflow_events += 1;
            match victim {
                Some(rank) => {
                    let evicted = state.buckets[rank].pop_front();
                    tracing::debug!(
                        target: "queue",
                        connection = %self.connection_id,
                        evicted_priority = ?evicted.as_ref().map(|m| m.priority),
                        incoming_priority = ?message.priority,
                        "queue overflow: evicted lower-priority message"
                    );
                }
                None => {
                    tracing::debug!(
                        target: "queue",
                        connection = %self.connection_id,
                        priority = ?message.priority,
                        "queue overflow: dropped incoming message"
                    );
                    return false;
                }
            }
        }

        state.buckets[incoming].push_back(message);
        state.metrics.messages_queued += 1;
        let size = state.total_size();
        if size > state.metrics.peak_queue_size {
            state.metrics.peak_queue_size = size;
        }
        true
    }

    /// Drain the buffered backlog into the registered processor.
    ///
    /// Single-flight: a flush racing an in-progress flush returns immediately
    /// with that flush's outcome instead of starting a second drain. Expired
    /// messages are discarded; delivery failures are retried up to the
    /// message's `max_attempts` and then discarded. Per-message failures
    /// never fail the flush as a whole.
    pub async fn flush_queue(&self) -> bool {
        {
            let mut state = self.inner.lock();
            if state.flush_in_progress {
                return state.last_flush_ok;
            }
            state.flush_in_progress = true;
            state.metrics.flush_operations += 1;
        }

        let processor = self.processor.lock().clone();
        let Some(processor) = processor else {
            // Nothing to deliver into; leave the backlog for the next flush.
            let mut state = self.inner.lock();
            state.flush_in_progress = false;
            state.last_flush_ok = true;
            return true;
        };

        let max_age = Duration::from_secs(self.limits.max_message_age_secs);
        loop {
            let mut message = {
                let mut state = self.inner.lock();
                if state.mode == QueueMode::Closed {
                    break;
                }
                match state.pop_next() {
                    Some(message) => message,
                    None => break,
                }
            };

            if message.is_expired(max_age) {
                let mut state = self.inner.lock();
                state.metrics.messages_expired += 1;
                continue;
            }

            // Bounded retry against the same processor; the attempt counter
            // lives on the message record.
            let mut delivered = false;
            while message.can_retry() {
                message.mark_attempt();
                match processor.process(&message).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(error) => {
                        tracing::debug!(
                            target: "queue",
                            connection = %self.connection_id,
                            message_id = %message.message_id,
                            attempt = message.attempts,
                            max_attempts = message.max_attempts,
                            "delivery attempt failed: {error}"
                        );
                    }
                }
            }

            let mut state = self.inner.lock();
            state.record_queue_duration(&message);
            if delivered {
                state.metrics.messages_flushed += 1;
            } else {
                state.metrics.messages_failed += 1;
            }
        }

        let mut state = self.inner.lock();
        state.flush_in_progress = false;
        state.last_flush_ok = true;
        true
    }

    /// Close the queue: terminal mode, buffered messages dropped, state
    /// observer unregistered. Safe to call concurrently with a flush: the
    /// flush finishes its in-flight message and then stops.
    pub fn close(&self, reason: &str) {
        let dropped = {
            let mut state = self.inner.lock();
            if state.mode == QueueMode::Closed {
                return;
            }
            state.mode = QueueMode::Closed;
            let mut dropped = 0;
            for bucket in &mut state.buckets {
                dropped += bucket.len();
                bucket.clear();
            }
            dropped
        };
        self.machine.remove_observer(&self.observer_id());
        tracing::debug!(
            target: "queue",
            connection = %self.connection_id,
            dropped,
            reason,
            "message queue closed"
        );
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            mode: state.mode,
            total_size: state.total_size(),
            critical: state.buckets[MessagePriority::Critical.index()].len(),
            high: state.buckets[MessagePriority::High.index()].len(),
            normal: state.buckets[MessagePriority::Normal.index()].len(),
            low: state.buckets[MessagePriority::Low.index()].len(),
            metrics: state.metrics,
            average_queue_duration_ms: if state.duration_samples == 0 {
                0.0
            } else {
                state.duration_total_ms / state.duration_samples as f64
            },
        }
    }

    fn set_mode_unless_closed(&self, mode: QueueMode) {
        let mut state = self.inner.lock();
        if state.mode != QueueMode::Closed {
            state.mode = mode;
        }
    }
}

#[async_trait]
impl StateObserver for MessageQueue {
    async fn on_state_change(
        &self,
        _connection_id: &str,
        state: ConnectionState,
        reason: &str,
    ) -> anyhow::Result<()> {
        match state {
            ConnectionState::ProcessingReady | ConnectionState::Degraded => {
                self.set_mode_unless_closed(QueueMode::PassThrough);
                // Drain anything buffered during setup so no message is
                // stranded when the connection becomes ready.
                self.flush_queue().await;
            }
            ConnectionState::Failed => {
                self.close(reason);
            }
            _ => {
                self.set_mode_unless_closed(QueueMode::Buffering);
            }
        }
        Ok(())
    }
}
