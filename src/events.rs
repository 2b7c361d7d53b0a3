//! Agent run event sequencing and completion validation.
//!
//! Every agent run must surface five lifecycle events to its user, in order:
//! `agent_started`, `agent_thinking`, `tool_executing`, `tool_completed`,
//! `agent_completed`. The monitor tracks each run as a session, records the
//! events it actually saw, and validates completeness and canonical order
//! before a session may be declared complete. Sessions are independent:
//! thousands can be tracked concurrently, keyed by session id.

use crate::config::EventMonitorConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The five mandatory agent lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarted,
    AgentThinking,
    ToolExecuting,
    ToolCompleted,
    AgentCompleted,
}

impl AgentEvent {
    /// The mandatory sequence, in delivery order.
    pub const CANONICAL_SEQUENCE: [Self; 5] = [
        Self::AgentStarted,
        Self::AgentThinking,
        Self::ToolExecuting,
        Self::ToolCompleted,
        Self::AgentCompleted,
    ];

    /// Position within the canonical sequence.
    pub fn canonical_rank(self) -> usize {
        match self {
            Self::AgentStarted => 0,
            Self::AgentThinking => 1,
            Self::ToolExecuting => 2,
            Self::ToolCompleted => 3,
            Self::AgentCompleted => 4,
        }
    }

    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::AgentThinking => "agent_thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::AgentCompleted => "agent_completed",
        }
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sequence validation failures. Fatal to the session's completion claim,
/// never to the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("session `{session_id}` is not tracked")]
    UnknownSession { session_id: String },
    #[error(
        "session `{session_id}` is missing critical events: [{}]",
        .missing.iter().map(|event| event.as_str()).collect::<Vec<_>>().join(", ")
    )]
    MissingCriticalEvents {
        session_id: String,
        missing: Vec<AgentEvent>,
    },
    #[error("session `{session_id}` received `{observed}` after `{previous}` (out of canonical order)")]
    OutOfOrder {
        session_id: String,
        previous: AgentEvent,
        observed: AgentEvent,
    },
    #[error("session `{session_id}` timed out before completing")]
    SessionTimedOut { session_id: String },
}

/// One received event with its arrival timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event: AgentEvent,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

/// Per-session observability snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub events: Vec<(AgentEvent, DateTime<Utc>)>,
    pub total_duration_ms: u64,
    pub complete: bool,
    pub timed_out: bool,
}

struct EventTracker {
    meta: Value,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    received: Vec<RecordedEvent>,
    completed_at: Option<DateTime<Utc>>,
    completed_mono: Option<Instant>,
    timed_out: bool,
}

/// Tracks and validates agent run event sequences per session.
pub struct EventMonitor {
    config: EventMonitorConfig,
    sessions: Mutex<HashMap<String, EventTracker>>,
}

impl EventMonitor {
    pub fn new(config: EventMonitorConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin tracking a run. Returns false (leaving the existing tracker
    /// untouched) when the session id is already tracked.
    pub fn start_session_tracking(&self, session_id: &str, meta: Value) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(
            session_id.to_string(),
            EventTracker {
                meta,
                started_at: Instant::now(),
                started_wall: Utc::now(),
                received: Vec::new(),
                completed_at: None,
                completed_mono: None,
                timed_out: false,
            },
        );
        true
    }

    /// Append a received event to the session's history.
    pub fn record_event(
        &self,
        session_id: &str,
        event: AgentEvent,
        payload: Value,
    ) -> Result<(), SequenceError> {
        let mut sessions = self.sessions.lock();
        let tracker = sessions
            .get_mut(session_id)
            .ok_or_else(|| SequenceError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        tracker.received.push(RecordedEvent {
            event,
            at: Utc::now(),
            payload,
        });
        Ok(())
    }

    /// Validate that the session saw all five canonical events in canonical
    /// order. Success marks the tracker complete.
    pub fn validate_session_completion(&self, session_id: &str) -> Result<(), SequenceError> {
        let mut sessions = self.sessions.lock();
        let tracker = sessions
            .get_mut(session_id)
            .ok_or_else(|| SequenceError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        if tracker.timed_out {
            return Err(SequenceError::SessionTimedOut {
                session_id: session_id.to_string(),
            });
        }

        let received: HashSet<AgentEvent> =
            tracker.received.iter().map(|record| record.event).collect();
        let missing: Vec<AgentEvent> = AgentEvent::CANONICAL_SEQUENCE
            .iter()
            .copied()
            .filter(|event| !received.contains(event))
            .collect();
        if !missing.is_empty() {
            return Err(SequenceError::MissingCriticalEvents {
                session_id: session_id.to_string(),
                missing,
            });
        }

        // All five present: the received ranks must be non-decreasing.
        let mut previous: Option<AgentEvent> = None;
        for record in &tracker.received {
            if let Some(prev) = previous {
                if record.event.canonical_rank() < prev.canonical_rank() {
                    return Err(SequenceError::OutOfOrder {
                        session_id: session_id.to_string(),
                        previous: prev,
                        observed: record.event,
                    });
                }
            }
            previous = Some(record.event);
        }

        tracker.completed_at = Some(Utc::now());
        tracker.completed_mono = Some(Instant::now());
        Ok(())
    }

    /// Whether the session has outlived the configured timeout without
    /// completing. Passive check, nothing is cancelled.
    pub fn check_session_timeout(&self, session_id: &str) -> Result<bool, SequenceError> {
        let sessions = self.sessions.lock();
        let tracker = sessions
            .get(session_id)
            .ok_or_else(|| SequenceError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let timeout = Duration::from_secs(self.config.session_timeout_secs);
        Ok(tracker.completed_at.is_none() && tracker.started_at.elapsed() > timeout)
    }

    /// Flag a session as timed out. Returns false for already-complete
    /// sessions; complete and timed-out are mutually exclusive.
    pub fn mark_session_timeout(&self, session_id: &str) -> Result<bool, SequenceError> {
        let mut sessions = self.sessions.lock();
        let tracker = sessions
            .get_mut(session_id)
            .ok_or_else(|| SequenceError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        if tracker.completed_at.is_some() {
            return Ok(false);
        }
        if !tracker.timed_out {
            tracker.timed_out = true;
            tracing::warn!(target: "events", session = %session_id, "agent session timed out");
        }
        Ok(true)
    }

    pub fn get_session_metrics(&self, session_id: &str) -> Option<SessionMetrics> {
        let sessions = self.sessions.lock();
        let tracker = sessions.get(session_id)?;
        let end = tracker
            .received
            .iter()
            .map(|record| record.at)
            .max()
            .unwrap_or(tracker.started_wall);
        let duration = end
            .signed_duration_since(tracker.started_wall)
            .to_std()
            .unwrap_or_default();
        Some(SessionMetrics {
            session_id: session_id.to_string(),
            events: tracker
                .received
                .iter()
                .map(|record| (record.event, record.at))
                .collect(),
            total_duration_ms: duration.as_millis() as u64,
            complete: tracker.completed_at.is_some(),
            timed_out: tracker.timed_out,
        })
    }

    pub fn session_meta(&self, session_id: &str) -> Option<Value> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|tracker| tracker.meta.clone())
    }

    /// Drop completed trackers older than `completed_retention_secs`.
    /// Returns how many were reclaimed.
    pub fn cleanup_completed_sessions(&self) -> usize {
        let retention = Duration::from_secs(self.config.completed_retention_secs);
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, tracker| {
            tracker
                .completed_mono
                .map(|at| at.elapsed() < retention)
                .unwrap_or(true)
        });
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
