//! Dispatch Events
//!
//! Notifications emitted by the routing core for UI and telemetry
//! collaborators. The core never persists them; it only broadcasts.
//!
//! # Design Philosophy
//!
//! Every component that has something to report holds a clone of the same
//! [`EventBus`]. Subscribers see one ordered stream of [`SwitchboardEvent`]s,
//! a tagged union that serializes as `{"type": "backend_selected", ...}`.
//! Emitting never blocks and never fails: with no subscribers the event is
//! dropped, and a subscriber that falls behind observes `Lagged`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::routing::config::TaskCategory;
use crate::routing::health::Alert;

/// Events from the routing core to its observers
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchboardEvent {
    /// The selector chose a primary backend for a request
    BackendSelected {
        /// Chosen backend
        backend_id: String,
        /// Task category of the request
        task: TaskCategory,
        /// Winning score (`None` when only one candidate survived filtering)
        score: Option<f64>,
        /// When the selection happened
        timestamp: DateTime<Utc>,
    },

    /// No available backend met the request's requirement
    SelectionFailed {
        /// Task category of the request
        task: TaskCategory,
        /// How many backends were available to choose from
        available: usize,
        /// When selection failed
        timestamp: DateTime<Utc>,
    },

    /// A health threshold was crossed
    PerformanceAlert {
        /// The alert, including the metric snapshot that triggered it
        alert: Alert,
        /// When the alert was raised
        timestamp: DateTime<Utc>,
    },

    /// A backend's health score fell into critical territory
    BackendDegraded {
        /// Affected backend
        backend_id: String,
        /// Health score at the time
        health_score: f64,
        /// When degradation was detected
        timestamp: DateTime<Utc>,
    },

    /// The dispatcher moved on to a fallback backend
    FallbackUsed {
        /// Backend whose attempt failed first
        primary_id: String,
        /// Fallback about to be attempted
        backend_id: String,
        /// Task category of the request
        task: TaskCategory,
        /// Attempts made before this one
        attempts_so_far: usize,
        /// When the fallback started
        timestamp: DateTime<Utc>,
    },

    /// A fallback attempt failed
    FallbackFailed {
        /// Fallback that failed
        backend_id: String,
        /// Failure description
        error: String,
        /// When it failed
        timestamp: DateTime<Utc>,
    },

    /// Every suitable backend failed
    FallbackExhausted {
        /// Task category of the request
        task: TaskCategory,
        /// Total invocation attempts
        attempts: usize,
        /// Last failure seen
        last_error: String,
        /// When the chain gave up
        timestamp: DateTime<Utc>,
    },
}

impl SwitchboardEvent {
    /// When the event was produced
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::BackendSelected { timestamp, .. }
            | Self::SelectionFailed { timestamp, .. }
            | Self::PerformanceAlert { timestamp, .. }
            | Self::BackendDegraded { timestamp, .. }
            | Self::FallbackUsed { timestamp, .. }
            | Self::FallbackFailed { timestamp, .. }
            | Self::FallbackExhausted { timestamp, .. } => *timestamp,
        }
    }

    /// Wire tag of the event
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendSelected { .. } => "backend_selected",
            Self::SelectionFailed { .. } => "selection_failed",
            Self::PerformanceAlert { .. } => "performance_alert",
            Self::BackendDegraded { .. } => "backend_degraded",
            Self::FallbackUsed { .. } => "fallback_used",
            Self::FallbackFailed { .. } => "fallback_failed",
            Self::FallbackExhausted { .. } => "fallback_exhausted",
        }
    }
}

/// Cloneable handle to the outbound event channel
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SwitchboardEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every event emitted after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SwitchboardEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event, returning how many subscribers received it
    pub fn emit(&self, event: SwitchboardEvent) -> usize {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(kind, "Event dropped, no subscribers");
                0
            }
        }
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
