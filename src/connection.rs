//! Per-connection lifecycle state machine.
//!
//! Every accepted WebSocket connection owns one state machine. Setup states
//! (`Connecting` through `ServicesReady`) keep the connection's message queue
//! buffering; `ProcessingReady` and `Degraded` are the operational states;
//! `Failed` is terminal and absorbing. Subscribers (the message queue, plus
//! anything observability wants to attach) register as async observers and
//! are notified on every transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Transition records kept per connection (oldest evicted).
const MAX_HISTORY: usize = 64;

/// Lifecycle state of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Accepted,
    Authenticated,
    ServicesReady,
    ProcessingReady,
    /// Operational but lower-confidence; distinguishable for observability.
    Degraded,
    /// Terminal. No transition leaves this state.
    Failed,
}

impl ConnectionState {
    /// Setup states: the connection is not yet ready to receive traffic.
    pub fn is_setup(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Accepted | Self::Authenticated | Self::ServicesReady
        )
    }

    /// States in which the connection's queue delivers instead of buffering.
    pub fn is_operational(self) -> bool {
        matches!(self, Self::ProcessingReady | Self::Degraded)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Errors from lifecycle transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("connection `{connection_id}` already failed; transition to {requested:?} rejected")]
    AlreadyFailed {
        connection_id: String,
        requested: ConnectionState,
    },
}

/// Async subscriber notified after each state transition.
///
/// Observer failures are logged and never block the remaining observers.
#[async_trait]
pub trait StateObserver: Send + Sync {
    async fn on_state_change(
        &self,
        connection_id: &str,
        state: ConnectionState,
        reason: &str,
    ) -> anyhow::Result<()>;
}

struct MachineState {
    current: ConnectionState,
    history: VecDeque<StateTransition>,
    observers: Vec<(String, Arc<dyn StateObserver>)>,
}

/// State machine for a single connection's lifecycle.
pub struct ConnectionStateMachine {
    connection_id: String,
    inner: Mutex<MachineState>,
}

impl ConnectionStateMachine {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            inner: Mutex::new(MachineState {
                current: ConnectionState::Connecting,
                history: VecDeque::new(),
                observers: Vec::new(),
            }),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().current
    }

    /// Snapshot of the recorded transitions, oldest first.
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Register an observer under an id. Re-registering the same id replaces
    /// the previous observer instead of adding a duplicate.
    pub fn add_observer(&self, id: impl Into<String>, observer: Arc<dyn StateObserver>) {
        let id = id.into();
        let mut state = self.inner.lock();
        if let Some(slot) = state.observers.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = observer;
        } else {
            state.observers.push((id, observer));
        }
    }

    /// Remove a registered observer. Returns false when the id is unknown.
    pub fn remove_observer(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        let before = state.observers.len();
        state.observers.retain(|(existing, _)| existing != id);
        state.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Move to a new state and notify every observer.
    ///
    /// `Failed` is absorbing: once entered, all further transitions are
    /// rejected. An observer that returns an error is logged and skipped;
    /// the remaining observers still run.
    pub async fn transition_to(
        &self,
        new_state: ConnectionState,
        reason: &str,
    ) -> Result<(), StateError> {
        let observers = {
            let mut state = self.inner.lock();
            if state.current.is_terminal() {
                return Err(StateError::AlreadyFailed {
                    connection_id: self.connection_id.clone(),
                    requested: new_state,
                });
            }
            if state.history.len() >= MAX_HISTORY {
                let _ = state.history.pop_front();
            }
            let from = state.current;
            state.history.push_back(StateTransition {
                from,
                to: new_state,
                reason: reason.to_string(),
                at: Utc::now(),
            });
            state.current = new_state;
            state.observers.clone()
        };

        for (id, observer) in observers {
            if let Err(error) = observer
                .on_state_change(&self.connection_id, new_state, reason)
                .await
            {
                tracing::warn!(
                    target: "connection",
                    observer = %id,
                    connection = %self.connection_id,
                    state = ?new_state,
                    "state observer failed: {error}"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl StateObserver for CountingObserver {
        async fn on_state_change(
            &self,
            _connection_id: &str,
            _state: ConnectionState,
            _reason: &str,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("observer exploded");
            }
            Ok(())
        }
    }

    fn observer(fail: bool) -> Arc<CountingObserver> {
        Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn transitions_record_history_and_notify() {
        let machine = ConnectionStateMachine::new("conn-1");
        let obs = observer(false);
        machine.add_observer("test", obs.clone());

        machine
            .transition_to(ConnectionState::Accepted, "handshake done")
            .await
            .expect("transition should succeed");
        machine
            .transition_to(ConnectionState::Authenticated, "token verified")
            .await
            .expect("transition should succeed");

        assert_eq!(machine.state(), ConnectionState::Authenticated);
        assert_eq!(obs.calls.load(Ordering::SeqCst), 2);

        let history = machine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, ConnectionState::Connecting);
        assert_eq!(history[1].to, ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn failed_is_absorbing() {
        let machine = ConnectionStateMachine::new("conn-2");
        machine
            .transition_to(ConnectionState::Failed, "auth rejected")
            .await
            .expect("transition into failed is allowed");

        let error = machine
            .transition_to(ConnectionState::Accepted, "retry")
            .await
            .expect_err("transitions out of failed must be rejected");
        assert_eq!(
            error,
            StateError::AlreadyFailed {
                connection_id: "conn-2".to_string(),
                requested: ConnectionState::Accepted,
            }
        );
        assert_eq!(machine.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let machine = ConnectionStateMachine::new("conn-3");
        let bad = observer(true);
        let good = observer(false);
        machine.add_observer("bad", bad.clone());
        machine.add_observer("good", good.clone());

        machine
            .transition_to(ConnectionState::Accepted, "handshake")
            .await
            .expect("transition should succeed despite observer failure");

        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observer_registration_is_idempotent() {
        let machine = ConnectionStateMachine::new("conn-4");
        let first = observer(false);
        let second = observer(false);
        machine.add_observer("queue", first.clone());
        machine.add_observer("queue", second.clone());
        assert_eq!(machine.observer_count(), 1);

        machine
            .transition_to(ConnectionState::Accepted, "handshake")
            .await
            .expect("transition should succeed");
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        assert!(machine.remove_observer("queue"));
        assert!(!machine.remove_observer("queue"));
    }
}
