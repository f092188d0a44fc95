//! Fallback Planning
//!
//! Decides what to try after the selected backend fails, and tracks what has
//! been tried so far for one request.
//!
//! # Architecture
//!
//! ```text
//! Selected backend (gpt-4) fails
//!         |
//!         v
//! plan_fallbacks(): catalog order, suitable, untried, not marked offline
//!         |
//!         v
//! Fallback 1: claude-3
//!         |
//!         v
//! Fallback 2: local-llama (last resort)
//!         |
//!         v
//! Exhausted -> terminal error with the attempt count
//! ```
//!
//! Fallbacks are not re-scored. The registry keeps primaries ahead of
//! fallback-tier backends (see [`Registry::register`]), each tier in
//! declaration order, so the order is predictable from configuration.
//!
//! [`Registry::register`]: super::registry::Registry::register

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::TaskCategory;
use super::health::HealthTracker;
use super::policy::{SelectionRequirement, Selector};
use super::registry::Backend;

// ============================================================================
// Fallback Context
// ============================================================================

/// Attempts made on behalf of one request
#[derive(Clone, Debug)]
pub struct FallbackContext {
    /// Task category of the request
    pub task: TaskCategory,

    /// Backend the selector chose
    pub primary: String,

    /// Backends that have been tried (in order)
    pub tried: Vec<String>,

    /// Backend currently being attempted
    pub current: String,

    /// Invocations made so far, retries included
    pub attempts: usize,

    /// Most recent failure
    pub last_error: Option<String>,

    /// Point after which no further attempt may start
    pub deadline: Option<Instant>,
}

impl FallbackContext {
    /// Start tracking a request whose selected backend is `primary`
    pub fn new(task: TaskCategory, primary: impl Into<String>) -> Self {
        let primary = primary.into();
        Self {
            task,
            tried: vec![primary.clone()],
            current: primary.clone(),
            primary,
            attempts: 0,
            last_error: None,
            deadline: None,
        }
    }

    /// Bound the whole chain by `budget` from now
    #[must_use]
    pub fn with_deadline(mut self, budget: Option<Duration>) -> Self {
        self.deadline = budget.map(|b| Instant::now() + b);
        self
    }

    /// Move on to a fallback backend
    pub fn fallback_to(&mut self, backend_id: impl Into<String>) {
        let backend_id = backend_id.into();
        self.tried.push(backend_id.clone());
        self.current = backend_id;
    }

    /// Count one invocation
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Remember why the latest invocation failed
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Check if a backend has already been tried
    #[must_use]
    pub fn has_tried(&self, backend_id: &str) -> bool {
        self.tried.iter().any(|b| b == backend_id)
    }

    /// Number of fallbacks moved to
    #[must_use]
    pub fn fallback_count(&self) -> usize {
        self.tried.len().saturating_sub(1)
    }

    /// Check if we're still on the selected backend
    #[must_use]
    pub fn is_original(&self) -> bool {
        self.current == self.primary
    }

    /// Time left before the deadline; `None` without a deadline
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Cap a per-attempt timeout by the time left
    #[must_use]
    pub fn attempt_budget(&self, timeout: Duration) -> Duration {
        self.remaining().map_or(timeout, |r| r.min(timeout))
    }

    /// Last error, or a placeholder when no attempt was made
    #[must_use]
    pub fn last_error_or_default(&self) -> String {
        self.last_error
            .clone()
            .unwrap_or_else(|| "no attempt was made".to_string())
    }
}

/// Backends to try after a failure, in catalog order
///
/// Skips backends already tried, backends that fail the requirement's hard
/// filters, and backends a collaborator marked offline. Health-derived
/// status is not consulted: a busy backend is still worth a try once the
/// preferred one has failed.
#[must_use]
pub fn plan_fallbacks(
    ctx: &FallbackContext,
    catalog: &[Arc<Backend>],
    requirement: &SelectionRequirement,
    tracker: &HealthTracker,
) -> Vec<Arc<Backend>> {
    catalog
        .iter()
        .filter(|b| !ctx.has_tried(&b.id))
        .filter(|b| Selector::is_suitable(b, requirement))
        .filter(|b| !tracker.is_externally_offline(&b.id))
        .cloned()
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
