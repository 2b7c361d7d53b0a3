//! Composition root wiring the relay components together.
//!
//! The surrounding backend (auth, agent executor, transport) talks to one
//! [`RelayService`]: it registers validated connections, feeds inbound client
//! messages and agent lifecycle events through it, and reads stats snapshots
//! back out. Everything here is dependency-injected; the service owns its
//! registry, rate limiter, event monitor, and performance monitor.

use crate::config::RelayConfig;
use crate::connection::StateError;
use crate::events::{AgentEvent, EventMonitor, SequenceError};
use crate::perf::PerformanceMonitor;
use crate::queue::registry::{MessageQueueRegistry, RegistryStats};
use crate::queue::{MessagePriority, MessageQueue, QueueStats};
use crate::ratelimit::{RateLimitError, RateLimiter, RateLimiterStats};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to the calling layer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("connection `{connection_id}` is not registered")]
    UnknownConnection { connection_id: String },
}

/// One relay core instance, shared across connection tasks.
pub struct RelayService {
    registry: Arc<MessageQueueRegistry>,
    rate_limiter: Arc<RateLimiter>,
    event_monitor: Arc<EventMonitor>,
    performance: Arc<PerformanceMonitor>,
}

impl RelayService {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(MessageQueueRegistry::new(config.queue)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            event_monitor: Arc::new(EventMonitor::new(config.events)),
            performance: Arc::new(PerformanceMonitor::new(config.performance)),
        }
    }

    pub fn registry(&self) -> &Arc<MessageQueueRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn event_monitor(&self) -> &Arc<EventMonitor> {
        &self.event_monitor
    }

    pub fn performance(&self) -> &Arc<PerformanceMonitor> {
        &self.performance
    }

    /// Admit a validated connection: rate-limit gate first, then create the
    /// state-machine/queue pair. On a rate-limit rejection the core never
    /// sees the connection.
    pub fn register_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<MessageQueue, RelayError> {
        self.rate_limiter.record_connection(user_id, connection_id)?;
        let queue = self.registry.create_message_queue(connection_id, user_id);
        tracing::debug!(
            target: "service",
            user = %user_id,
            connection = %connection_id,
            "connection registered"
        );
        Ok(queue)
    }

    /// Tear down one connection across every component. Returns false when
    /// the connection was unknown to the registry.
    pub fn disconnect(&self, user_id: &str, connection_id: &str) -> bool {
        self.rate_limiter.remove_connection(user_id, connection_id);
        self.performance.remove_connection(connection_id);
        self.registry.remove_message_queue(connection_id)
    }

    /// Gate and enqueue one inbound client message at normal priority.
    pub async fn accept_client_message(
        &self,
        user_id: &str,
        connection_id: &str,
        message_type: &str,
        message_data: Value,
    ) -> Result<bool, RelayError> {
        self.rate_limiter.record_message(user_id)?;
        let queue = self.registry.get_message_queue(connection_id).ok_or_else(|| {
            RelayError::UnknownConnection {
                connection_id: connection_id.to_string(),
            }
        })?;
        Ok(queue
            .enqueue_message(message_data, message_type, MessagePriority::Normal, None)
            .await)
    }

    /// Record an agent lifecycle event against its session and enqueue the
    /// corresponding WebSocket frame at high priority.
    pub async fn deliver_agent_event(
        &self,
        session_id: &str,
        connection_id: &str,
        event: AgentEvent,
        payload: Value,
    ) -> Result<bool, RelayError> {
        self.event_monitor
            .record_event(session_id, event, payload.clone())?;
        let queue = self.registry.get_message_queue(connection_id).ok_or_else(|| {
            RelayError::UnknownConnection {
                connection_id: connection_id.to_string(),
            }
        })?;
        let frame = json!({
            "type": event.as_str(),
            "session_id": session_id,
            "payload": payload,
        });
        Ok(queue
            .enqueue_message(frame, event.as_str(), MessagePriority::High, None)
            .await)
    }

    pub fn queue_stats(&self, connection_id: &str) -> Option<QueueStats> {
        self.registry
            .get_message_queue(connection_id)
            .map(|queue| queue.get_queue_stats())
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.get_registry_stats()
    }

    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.rate_limiter.get_stats()
    }
}
