//! Process-wide table of per-connection message queues.
//!
//! The registry is an explicitly constructed service object, passed by
//! reference to whoever needs it; there is no hidden global. Its lock covers
//! only the connection-id map; queue internals have their own locks.

use super::{MessageQueue, QueueMode};
use crate::config::QueueLimits;
use crate::connection::ConnectionStateMachine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

struct RegisteredQueue {
    queue: MessageQueue,
    machine: Arc<ConnectionStateMachine>,
}

/// Aggregate snapshot over every registered queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_queues: usize,
    pub buffering: usize,
    pub pass_through: usize,
    pub closed: usize,
    /// Buffered messages summed across all queues.
    pub total_buffered_messages: usize,
}

/// connection_id → queue map with idempotent creation.
pub struct MessageQueueRegistry {
    default_limits: QueueLimits,
    inner: RwLock<HashMap<String, RegisteredQueue>>,
}

impl MessageQueueRegistry {
    pub fn new(default_limits: QueueLimits) -> Self {
        Self {
            default_limits,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Get-or-create the queue for a connection, along with its state
    /// machine. A second call with the same connection id returns the
    /// existing queue untouched.
    pub fn create_message_queue(&self, connection_id: &str, user_id: &str) -> MessageQueue {
        self.create_message_queue_with(connection_id, user_id, self.default_limits)
    }

    /// Same as [`create_message_queue`](Self::create_message_queue) with
    /// explicit per-queue limits (only applied when the queue is new).
    pub fn create_message_queue_with(
        &self,
        connection_id: &str,
        user_id: &str,
        limits: QueueLimits,
    ) -> MessageQueue {
        if let Some(entry) = self.inner.read().get(connection_id) {
            return entry.queue.clone();
        }

        let mut map = self.inner.write();
        // Another caller may have won the race between the read and write
        // lock acquisitions.
        if let Some(entry) = map.get(connection_id) {
            return entry.queue.clone();
        }

        let machine = Arc::new(ConnectionStateMachine::new(connection_id));
        let queue = MessageQueue::new(connection_id, user_id, limits, Arc::clone(&machine));
        map.insert(
            connection_id.to_string(),
            RegisteredQueue {
                queue: queue.clone(),
                machine,
            },
        );
        tracing::debug!(
            target: "registry",
            connection = %connection_id,
            user = %user_id,
            "message queue created"
        );
        queue
    }

    pub fn get_message_queue(&self, connection_id: &str) -> Option<MessageQueue> {
        self.inner
            .read()
            .get(connection_id)
            .map(|entry| entry.queue.clone())
    }

    pub fn get_state_machine(&self, connection_id: &str) -> Option<Arc<ConnectionStateMachine>> {
        self.inner
            .read()
            .get(connection_id)
            .map(|entry| Arc::clone(&entry.machine))
    }

    /// Close and drop a connection's queue. Returns false when the id was
    /// not registered (including a repeated removal of the same id).
    pub fn remove_message_queue(&self, connection_id: &str) -> bool {
        let removed = self.inner.write().remove(connection_id);
        match removed {
            Some(entry) => {
                entry.queue.close("removed from registry");
                true
            }
            None => false,
        }
    }

    /// Queues currently in pass-through, i.e. operationally active.
    pub fn get_all_active_queues(&self) -> Vec<MessageQueue> {
        self.inner
            .read()
            .values()
            .filter(|entry| entry.queue.mode() == QueueMode::PassThrough)
            .map(|entry| entry.queue.clone())
            .collect()
    }

    pub fn get_registry_stats(&self) -> RegistryStats {
        let map = self.inner.read();
        let mut stats = RegistryStats {
            total_queues: map.len(),
            ..RegistryStats::default()
        };
        for entry in map.values() {
            match entry.queue.mode() {
                QueueMode::Buffering => stats.buffering += 1,
                QueueMode::PassThrough => stats.pass_through += 1,
                QueueMode::Closed => stats.closed += 1,
            }
            stats.total_buffered_messages += entry.queue.total_size();
        }
        stats
    }

    pub fn queue_count(&self) -> usize {
        self.inner.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::queue::MessagePriority;
    use serde_json::json;

    fn registry() -> MessageQueueRegistry {
        MessageQueueRegistry::new(QueueLimits::default())
    }

    #[test]
    fn creation_is_idempotent_per_connection() {
        let registry = registry();
        let first = registry.create_message_queue("conn-1", "user-a");
        let second = registry.create_message_queue("conn-1", "user-a");

        assert_eq!(registry.queue_count(), 1);
        assert_eq!(first.connection_id(), second.connection_id());

        // Clones share state: a message buffered through one handle is
        // visible through the other.
        let third = registry
            .get_message_queue("conn-1")
            .expect("queue must be registered");
        assert_eq!(third.total_size(), first.total_size());
    }

    #[test]
    fn removal_closes_and_second_removal_fails() {
        let registry = registry();
        let queue = registry.create_message_queue("conn-1", "user-a");

        assert!(registry.remove_message_queue("conn-1"));
        assert_eq!(queue.mode(), QueueMode::Closed);
        assert!(!registry.remove_message_queue("conn-1"));
        assert!(registry.get_message_queue("conn-1").is_none());
    }

    #[tokio::test]
    async fn stats_track_modes_and_buffered_totals() {
        let registry = registry();
        let buffering = registry.create_message_queue("conn-1", "user-a");
        registry.create_message_queue("conn-2", "user-b");

        buffering
            .enqueue_message(json!({"n": 1}), "chat_message", MessagePriority::Normal, None)
            .await;
        buffering
            .enqueue_message(json!({"n": 2}), "chat_message", MessagePriority::Normal, None)
            .await;

        let machine = registry
            .get_state_machine("conn-2")
            .expect("state machine must be registered");
        machine
            .transition_to(ConnectionState::ProcessingReady, "ready")
            .await
            .expect("transition should succeed");

        let stats = registry.get_registry_stats();
        assert_eq!(stats.total_queues, 2);
        assert_eq!(stats.buffering, 1);
        assert_eq!(stats.pass_through, 1);
        assert_eq!(stats.total_buffered_messages, 2);

        let active = registry.get_all_active_queues();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].connection_id(), "conn-2");
    }
}
