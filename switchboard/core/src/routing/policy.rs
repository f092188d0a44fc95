//! Selection Policy
//!
//! Picks the best backend for a request from the currently available
//! candidates.
//!
//! # Selection Flow
//!
//! ```text
//! 1. Filter: capabilities, context window, nominal latency, cost per request
//! 2. Nothing left          -> None
//! 3. Exactly one left      -> that backend, unscored
//! 4. Otherwise score each  -> highest wins, ties go to catalog order
//! ```
//!
//! # Scoring
//!
//! Every sub-score lies in `[0, 1]` and is weighted per [`SelectionStrategy`]:
//!
//! | Sub-score        | Source                                          |
//! |------------------|-------------------------------------------------|
//! | accuracy         | success rate (0.8 without history)              |
//! | response time    | `1 - nominal / max_response_time`               |
//! | reliability      | health score (0.9 when never seen)              |
//! | cost             | `1 - cost_per_request / max_cost_per_request`   |
//! | capability match | fraction of required capabilities present       |
//!
//! Backends on the task category's preference list get a flat bonus.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::{Capability, CapabilitySet, SelectionStrategy, TaskCategory};
use super::health::{BackendMetrics, MetricsSnapshot};
use super::registry::Backend;

/// Accuracy assumed for a backend with no completions
const DEFAULT_ACCURACY: f64 = 0.8;

/// Reliability assumed for a backend the tracker has never seen
const DEFAULT_RELIABILITY: f64 = 0.9;

/// Bonus for backends on the task's preference list
const PREFERENCE_BONUS: f64 = 0.02;

// ============================================================================
// Selection Requirement
// ============================================================================

/// Latency and quality floor for a request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceFloor {
    /// Hard ceiling on a backend's nominal response time
    pub max_response_time_ms: u64,
    /// Desired success rate (advisory)
    pub min_accuracy: f64,
    /// Desired health score (advisory)
    pub min_reliability: f64,
}

impl Default for PerformanceFloor {
    fn default() -> Self {
        Self {
            max_response_time_ms: 30_000,
            min_accuracy: 0.0,
            min_reliability: 0.0,
        }
    }
}

/// Spending limits for a request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostCeiling {
    /// Hard ceiling on the cost of a nominal 1000-token request
    pub max_cost_per_request: f64,
    /// Overall budget cap, passed through for collaborators
    pub budget: f64,
}

impl Default for CostCeiling {
    fn default() -> Self {
        Self {
            max_cost_per_request: 1.0,
            budget: 100.0,
        }
    }
}

/// Why a requirement was rejected before selection
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid selection requirement: {0}")]
pub struct InvalidRequirement(pub String);

/// What a request needs from a backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectionRequirement {
    pub task: TaskCategory,
    /// Tokens of context the request needs
    pub context_size: u32,
    /// Capabilities every candidate must have
    pub capabilities: CapabilitySet,
    pub performance: PerformanceFloor,
    pub cost: CostCeiling,
}

impl SelectionRequirement {
    /// Create a requirement for a task with permissive limits
    #[must_use]
    pub fn new(task: TaskCategory) -> Self {
        Self {
            task,
            context_size: 0,
            capabilities: CapabilitySet::empty(),
            performance: PerformanceFloor::default(),
            cost: CostCeiling::default(),
        }
    }

    #[must_use]
    pub fn with_context_size(mut self, tokens: u32) -> Self {
        self.context_size = tokens;
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_max_response_time_ms(mut self, ms: u64) -> Self {
        self.performance.max_response_time_ms = ms;
        self
    }

    #[must_use]
    pub fn with_min_accuracy(mut self, accuracy: f64) -> Self {
        self.performance.min_accuracy = accuracy;
        self
    }

    #[must_use]
    pub fn with_min_reliability(mut self, reliability: f64) -> Self {
        self.performance.min_reliability = reliability;
        self
    }

    #[must_use]
    pub fn with_max_cost_per_request(mut self, cost: f64) -> Self {
        self.cost.max_cost_per_request = cost;
        self
    }

    #[must_use]
    pub fn with_budget(mut self, budget: f64) -> Self {
        self.cost.budget = budget;
        self
    }

    /// Reject requirements no backend could be scored against
    pub fn validate(&self) -> Result<(), InvalidRequirement> {
        if self.performance.max_response_time_ms == 0 {
            return Err(InvalidRequirement(
                "max_response_time_ms must be greater than zero".into(),
            ));
        }
        let max_cost = self.cost.max_cost_per_request;
        if !max_cost.is_finite() || max_cost <= 0.0 {
            return Err(InvalidRequirement(format!(
                "max_cost_per_request must be a positive number, got {max_cost}"
            )));
        }
        for (name, value) in [
            ("min_accuracy", self.performance.min_accuracy),
            ("min_reliability", self.performance.min_reliability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(InvalidRequirement(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Scores
// ============================================================================

/// Sub-scores behind a backend's final score
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub accuracy: f64,
    pub response_time: f64,
    pub reliability: f64,
    pub cost: f64,
    pub capability_match: f64,
    pub preference_bonus: f64,
}

/// A suitable backend and how well it scored
#[derive(Clone, Debug)]
pub struct ScoredBackend {
    pub backend: Arc<Backend>,
    /// Final score in `[0, 1]`
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Outcome of a successful selection
#[derive(Clone, Debug)]
pub struct SelectionResult {
    /// The chosen backend
    pub backend: Arc<Backend>,
    /// Winning score; `None` when the winner was the only suitable candidate
    pub score: Option<f64>,
    /// Remaining suitable candidates, best first
    pub runner_ups: Vec<ScoredBackend>,
}

/// `max(0, 1 - value / ceiling)`, zero for a non-positive ceiling
fn headroom(value: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 {
        return 0.0;
    }
    (1.0 - value / ceiling).max(0.0)
}

// ============================================================================
// Selector
// ============================================================================

/// Scores and picks backends under one selection strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    strategy: SelectionStrategy,
}

impl Selector {
    #[must_use]
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self { strategy }
    }

    #[must_use]
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Whether a backend passes every hard filter of a requirement
    #[must_use]
    pub fn is_suitable(backend: &Backend, requirement: &SelectionRequirement) -> bool {
        backend.capabilities.is_superset(&requirement.capabilities)
            && backend.context_window >= requirement.context_size
            && backend.response_time_ms <= requirement.performance.max_response_time_ms
            && backend.cost_per_request() <= requirement.cost.max_cost_per_request
    }

    /// Score one backend, ignoring hard filters
    #[must_use]
    pub fn score(
        &self,
        backend: &Backend,
        requirement: &SelectionRequirement,
        metrics: Option<&BackendMetrics>,
    ) -> (f64, ScoreBreakdown) {
        let weights = self.strategy.weights();

        let breakdown = ScoreBreakdown {
            accuracy: metrics
                .and_then(BackendMetrics::success_rate)
                .unwrap_or(DEFAULT_ACCURACY),
            response_time: headroom(
                backend.response_time_ms as f64,
                requirement.performance.max_response_time_ms as f64,
            ),
            reliability: metrics.map_or(DEFAULT_RELIABILITY, |m| m.health_score),
            cost: headroom(
                backend.cost_per_request(),
                requirement.cost.max_cost_per_request,
            ),
            capability_match: backend
                .capabilities
                .match_fraction(&requirement.capabilities),
            preference_bonus: if requirement
                .task
                .preferred_backends()
                .contains(&backend.id.as_str())
            {
                PREFERENCE_BONUS
            } else {
                0.0
            },
        };

        let score = breakdown.accuracy * weights.accuracy
            + breakdown.response_time * weights.response_time
            + breakdown.reliability * weights.reliability
            + breakdown.cost * weights.cost
            + breakdown.capability_match * weights.capability_match
            + breakdown.preference_bonus;

        (score.clamp(0.0, 1.0), breakdown)
    }

    /// Score every suitable candidate, best first; ties keep candidate order
    #[must_use]
    pub fn rank(
        &self,
        requirement: &SelectionRequirement,
        candidates: &[Arc<Backend>],
        metrics: &MetricsSnapshot,
    ) -> Vec<ScoredBackend> {
        let mut ranked: Vec<ScoredBackend> = candidates
            .iter()
            .filter(|b| Self::is_suitable(b, requirement))
            .map(|b| {
                let (score, breakdown) = self.score(b, requirement, metrics.get(&b.id));
                tracing::debug!(
                    backend = %b.id,
                    task = %requirement.task,
                    score,
                    accuracy = breakdown.accuracy,
                    response_time = breakdown.response_time,
                    reliability = breakdown.reliability,
                    cost = breakdown.cost,
                    "Scored candidate"
                );
                ScoredBackend {
                    backend: b.clone(),
                    score,
                    breakdown,
                }
            })
            .collect();

        // Stable sort keeps catalog order among equal scores
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    /// Pick the best suitable backend, or `None` when nothing qualifies
    #[must_use]
    pub fn choose(
        &self,
        requirement: &SelectionRequirement,
        candidates: &[Arc<Backend>],
        metrics: &MetricsSnapshot,
    ) -> Option<SelectionResult> {
        let suitable: Vec<&Arc<Backend>> = candidates
            .iter()
            .filter(|b| Self::is_suitable(b, requirement))
            .collect();

        match suitable.as_slice() {
            [] => {
                tracing::debug!(
                    task = %requirement.task,
                    candidates = candidates.len(),
                    "No candidate passed the hard filters"
                );
                None
            }
            [only] => Some(SelectionResult {
                backend: Arc::clone(*only),
                score: None,
                runner_ups: Vec::new(),
            }),
            _ => {
                let mut ranked = self.rank(requirement, candidates, metrics).into_iter();
                let winner = ranked.next()?;
                Some(SelectionResult {
                    backend: winner.backend,
                    score: Some(winner.score),
                    runner_ups: ranked.collect(),
                })
            }
        }
    }

    /// Suitable candidates other than `primary_id`, in candidate order
    #[must_use]
    pub fn alternatives(
        primary_id: &str,
        candidates: &[Arc<Backend>],
        requirement: &SelectionRequirement,
    ) -> Vec<Arc<Backend>> {
        candidates
            .iter()
            .filter(|b| b.id != primary_id && Self::is_suitable(b, requirement))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
