//! Request Dispatcher
//!
//! The main entry point for running a request against the backend pool.
//! Coordinates the selector, balancer, invoker and health tracker, and owns
//! the retry and fallback path.
//!
//! # Request Lifecycle
//!
//! ```text
//! Selecting --> Invoking --+--> Succeeded
//!                          |
//!                          +--> Retrying (same backend, with backoff)
//!                          |
//!                          +--> Fallback --> Invoking --> ... --> Succeeded
//!                                                             +-> Exhausted
//! ```
//!
//! Every invocation, successful or not, is recorded with the health tracker
//! and the balancer before the next step is taken.
//!
//! # Usage
//!
//! ```ignore
//! let dispatcher = Dispatcher::from_config(&config, Arc::new(MyInvoker), None);
//! let requirement = SelectionRequirement::new(TaskCategory::CodeGeneration);
//! let response = dispatcher
//!     .execute("write a parser", &requirement, &RequestOptions::default())
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{join_all, FutureExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::balancer::{Balancer, LoadBalancingStats};
use super::config::{DispatchSettings, SelectionStrategy, TaskCategory};
use super::fallback::{plan_fallbacks, FallbackContext};
use super::health::{Completion, HealthTracker};
use super::inflight::{fingerprint, InFlight, Role};
use super::instances::{HealthCheckResult, InstanceStatus};
use super::metrics::{DispatchMetrics, DispatchMetricsSummary};
use super::policy::{InvalidRequirement, SelectionRequirement, SelectionResult, Selector};
use super::registry::{Backend, Registry};
use crate::backend::{HealthProbe, Invocation, InvokeError, Invoker, RequestOptions};
use crate::config::SwitchboardConfig;
use crate::events::{EventBus, SwitchboardEvent};

// ============================================================================
// Response / Errors
// ============================================================================

/// A successful dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    /// The response text
    pub content: String,
    /// Tokens consumed by the successful invocation
    pub tokens_used: u64,
    /// Wall time of the successful invocation
    pub response_time_ms: u64,
    /// Backend that answered
    pub backend_id: String,
    /// Instance that answered
    pub instance_id: String,
    /// Invocations made, the successful one included
    pub attempts: usize,
    /// Whether the answer came from a fallback backend
    pub used_fallback: bool,
}

/// The single error surfaced to callers of [`Dispatcher::execute`]
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("no suitable backend for {task} ({available} available)")]
    NoSuitableBackend { task: TaskCategory, available: usize },

    #[error("all backends exhausted for {task} after {attempts} attempts: {last_error}")]
    AllBackendsExhausted {
        task: TaskCategory,
        attempts: usize,
        last_error: String,
    },

    #[error("deadline of {deadline_ms}ms exceeded for {task} after {attempts} attempts")]
    DeadlineExceeded {
        task: TaskCategory,
        attempts: usize,
        deadline_ms: u64,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The dispatch task panicked or the runtime shut down under it
    #[error("dispatch aborted: {0}")]
    Aborted(String),
}

impl DispatchError {
    /// Invocations made before giving up
    #[must_use]
    pub fn attempts(&self) -> usize {
        match self {
            Self::AllBackendsExhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => {
                *attempts
            }
            Self::NoSuitableBackend { .. } | Self::Configuration(_) | Self::Aborted(_) => 0,
        }
    }

    /// Task category of the failed request, when known
    #[must_use]
    pub fn task(&self) -> Option<TaskCategory> {
        match self {
            Self::NoSuitableBackend { task, .. }
            | Self::AllBackendsExhausted { task, .. }
            | Self::DeadlineExceeded { task, .. } => Some(*task),
            Self::Configuration(_) | Self::Aborted(_) => None,
        }
    }
}

impl From<InvalidRequirement> for DispatchError {
    fn from(value: InvalidRequirement) -> Self {
        Self::Configuration(value.to_string())
    }
}

type DispatchOutcome = Result<DispatchResponse, DispatchError>;

/// Aggregate snapshot of the dispatcher and its backends
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrchestrationStatus {
    pub total_backends: usize,
    pub available_backends: usize,
    /// Distinct requests currently in flight
    pub active_requests: usize,
    /// Mean of per-backend average response times
    pub average_response_time_ms: f64,
    /// Successful over total completions across all backends
    pub success_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// Why one backend produced no answer
enum AttemptError {
    Failed,
    DeadlineExceeded,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Collaborators a [`Dispatcher`] is assembled from
pub struct DispatcherParts {
    pub registry: Arc<Registry>,
    pub tracker: Arc<HealthTracker>,
    pub selector: Selector,
    pub balancer: Arc<Balancer>,
    pub invoker: Arc<dyn Invoker>,
    pub probe: Option<Arc<dyn HealthProbe>>,
    pub settings: DispatchSettings,
    /// Period of [`Dispatcher::spawn_health_monitor`]
    pub health_check_interval: Duration,
}

struct DispatcherInner {
    registry: Arc<Registry>,
    tracker: Arc<HealthTracker>,
    selector: RwLock<Selector>,
    balancer: Arc<Balancer>,
    invoker: Arc<dyn Invoker>,
    probe: Option<Arc<dyn HealthProbe>>,
    settings: DispatchSettings,
    health_check_interval: Duration,
    metrics: DispatchMetrics,
    in_flight: InFlight<DispatchOutcome>,
}

/// Routes requests to backends; cheap to clone
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Assemble a dispatcher from its collaborators
    ///
    /// Backends already in the registry but unknown to the tracker are
    /// registered with it.
    #[must_use]
    pub fn new(parts: DispatcherParts) -> Self {
        for backend in parts.registry.all() {
            if !parts.tracker.is_registered(&backend.id) {
                parts.tracker.register_backend(&backend.id);
            }
        }

        Self {
            inner: Arc::new(DispatcherInner {
                registry: parts.registry,
                tracker: parts.tracker,
                selector: RwLock::new(parts.selector),
                balancer: parts.balancer,
                invoker: parts.invoker,
                probe: parts.probe,
                settings: parts.settings,
                health_check_interval: parts.health_check_interval,
                metrics: DispatchMetrics::new(),
                in_flight: InFlight::new(),
            }),
        }
    }

    /// Build every collaborator from loaded configuration
    #[must_use]
    pub fn from_config(
        config: &SwitchboardConfig,
        invoker: Arc<dyn Invoker>,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Self {
        let events = EventBus::new(config.dispatch.event_capacity);
        let tracker = Arc::new(HealthTracker::new(config.alerts.clone(), events));
        let registry = Arc::new(Registry::from_catalog(config.catalog.iter().cloned()));
        let balancer = Arc::new(Balancer::new(config.balancing.clone(), tracker.clone()));

        tracing::info!(
            backends = registry.len(),
            selection = %config.selection_strategy,
            balancing = %config.balancing.strategy,
            invoker = invoker.name(),
            "Dispatcher configured"
        );

        Self::new(DispatcherParts {
            registry,
            tracker,
            selector: Selector::new(config.selection_strategy),
            balancer,
            invoker,
            probe,
            settings: config.dispatch.clone(),
            health_check_interval: config.balancing.health_check_interval,
        })
    }

    /// Add a backend to the catalog and start tracking it
    pub fn register_backend(&self, backend: Backend) -> Arc<Backend> {
        let backend = self.inner.registry.register(backend);
        if !self.inner.tracker.is_registered(&backend.id) {
            self.inner.tracker.register_backend(&backend.id);
        }
        backend
    }

    /// Run a request, falling back across backends until one answers
    ///
    /// Concurrent calls with the same prompt and requirement share a single
    /// dispatch and receive the same outcome. The dispatch runs as its own
    /// task: dropping a caller (a timeout around `execute`, say) does not
    /// cancel it, and its attempts are still recorded.
    pub async fn execute(
        &self,
        prompt: &str,
        requirement: &SelectionRequirement,
        options: &RequestOptions,
    ) -> Result<DispatchResponse, DispatchError> {
        if self.inner.registry.is_empty() {
            return Err(DispatchError::Configuration(
                "backend catalog is empty".to_string(),
            ));
        }
        requirement.validate()?;

        let key = fingerprint(prompt, requirement);
        let (outcome, role) = self.inner.in_flight.join_or_start(&key, || {
            let inner = Arc::clone(&self.inner);
            let prompt = prompt.to_string();
            let requirement = requirement.clone();
            let options = options.clone();
            let key = key.clone();
            let task = requirement.task;

            // Runs to completion even if every caller goes away
            let handle = tokio::spawn(async move {
                let _entry = inner.in_flight.completion_guard(&key);
                inner.dispatch(&prompt, &requirement, &options).await
            });
            async move {
                handle.await.unwrap_or_else(|e| {
                    tracing::error!(task = %task, error = %e, "Dispatch task failed");
                    Err(DispatchError::Aborted(e.to_string()))
                })
            }
            .boxed()
        });

        if role == Role::Follower {
            self.inner.metrics.deduplicated.inc();
            tracing::debug!(
                fingerprint = %&key[..12],
                task = %requirement.task,
                "Joined identical in-flight request"
            );
        }

        outcome.await
    }

    /// Dry-run selection over the currently available backends
    #[must_use]
    pub fn select(&self, requirement: &SelectionRequirement) -> Option<SelectionResult> {
        let candidates = self.inner.registry.available(&self.inner.tracker);
        let snapshot = self.inner.tracker.snapshot();
        self.inner
            .selector
            .read()
            .choose(requirement, &candidates, &snapshot)
    }

    /// Aggregate status snapshot
    #[must_use]
    pub fn status(&self) -> OrchestrationStatus {
        let inner = &self.inner;
        let metrics = inner.tracker.all_metrics();

        let average_response_time_ms = if metrics.is_empty() {
            0.0
        } else {
            metrics
                .iter()
                .map(|m| m.average_response_time_ms)
                .sum::<f64>()
                / metrics.len() as f64
        };
        let total: u64 = metrics.iter().map(|m| m.total_requests).sum();
        let successful: u64 = metrics.iter().map(|m| m.successful_requests).sum();

        OrchestrationStatus {
            total_backends: inner.registry.len(),
            available_backends: inner.registry.available(&inner.tracker).len(),
            active_requests: inner.in_flight.len(),
            average_response_time_ms,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            last_updated: Utc::now(),
        }
    }

    /// Probe every instance of every backend concurrently
    ///
    /// Without a configured probe nothing is checked. Probe failures are
    /// recorded as unhealthy readings, never returned as errors.
    pub async fn health_check_all(&self) -> Vec<HealthCheckResult> {
        let Some(probe) = self.inner.probe.as_deref() else {
            tracing::debug!("No health probe configured, skipping health checks");
            return Vec::new();
        };

        let mut targets = Vec::new();
        for backend in self.inner.registry.all() {
            for instance_id in backend.endpoint_ids() {
                targets.push((backend.id.clone(), instance_id));
            }
        }

        let tracker = &self.inner.tracker;
        let results = join_all(
            targets
                .iter()
                .map(|(backend_id, instance_id)| {
                    tracker.instance_health_check(backend_id, instance_id, probe)
                }),
        )
        .await;

        let unhealthy = results
            .iter()
            .filter(|r| r.health.status == InstanceStatus::Unhealthy)
            .count();
        tracing::debug!(checked = results.len(), unhealthy, "Health check complete");
        results
    }

    /// Run [`Dispatcher::health_check_all`] periodically until the handle is aborted
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let period = self.inner.health_check_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                dispatcher.health_check_all().await;
            }
        })
    }

    /// Dispatcher counters and latency percentiles
    #[must_use]
    pub fn metrics(&self) -> DispatchMetricsSummary {
        self.inner.metrics.summary()
    }

    /// Balancer statistics over the whole catalog
    #[must_use]
    pub fn balancing_stats(&self) -> LoadBalancingStats {
        self.inner.balancer.stats(&self.inner.registry.all())
    }

    /// Subscribe to dispatcher, selector and health events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SwitchboardEvent> {
        self.inner.tracker.events().subscribe()
    }

    #[must_use]
    pub fn selection_strategy(&self) -> SelectionStrategy {
        self.inner.selector.read().strategy()
    }

    /// Switch the selection strategy for subsequent requests
    pub fn set_selection_strategy(&self, strategy: SelectionStrategy) {
        *self.inner.selector.write() = Selector::new(strategy);
        tracing::info!(strategy = %strategy, "Selection strategy changed");
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.inner.tracker
    }

    #[must_use]
    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.inner.balancer
    }

    #[must_use]
    pub fn settings(&self) -> &DispatchSettings {
        &self.inner.settings
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.inner.registry.len())
            .field("invoker", &self.inner.invoker.name())
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatch Path
// ============================================================================

impl DispatcherInner {
    fn events(&self) -> &EventBus {
        self.tracker.events()
    }

    async fn dispatch(
        &self,
        prompt: &str,
        requirement: &SelectionRequirement,
        options: &RequestOptions,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        self.metrics.requests.inc();

        let result = self
            .select_and_run(&request_id, prompt, requirement, options)
            .await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.latency.record(elapsed_ms);
        match &result {
            Ok(response) => {
                self.metrics.succeeded.inc();
                if response.used_fallback {
                    self.metrics.fallbacks_used.inc();
                }
            }
            Err(DispatchError::NoSuitableBackend { .. }) => {
                self.metrics.no_suitable_backend.inc();
            }
            Err(_) => self.metrics.exhausted.inc(),
        }
        result
    }

    async fn select_and_run(
        &self,
        request_id: &str,
        prompt: &str,
        requirement: &SelectionRequirement,
        options: &RequestOptions,
    ) -> DispatchOutcome {
        let task = requirement.task;
        let candidates = self.registry.available(&self.tracker);
        let snapshot = self.tracker.snapshot();
        let selection = self.selector.read().choose(requirement, &candidates, &snapshot);

        let Some(selection) = selection else {
            tracing::warn!(
                request_id,
                task = %task,
                available = candidates.len(),
                "No suitable backend"
            );
            self.events().emit(SwitchboardEvent::SelectionFailed {
                task,
                available: candidates.len(),
                timestamp: Utc::now(),
            });
            return Err(DispatchError::NoSuitableBackend {
                task,
                available: candidates.len(),
            });
        };

        tracing::info!(
            request_id,
            task = %task,
            backend = %selection.backend.id,
            score = ?selection.score,
            runner_ups = selection.runner_ups.len(),
            "Selected backend"
        );
        self.events().emit(SwitchboardEvent::BackendSelected {
            backend_id: selection.backend.id.clone(),
            task,
            score: selection.score,
            timestamp: Utc::now(),
        });

        let deadline = options.deadline.or(self.settings.request_deadline);
        let mut ctx = FallbackContext::new(task, &selection.backend.id).with_deadline(deadline);

        match self
            .attempt_backend(&selection.backend, prompt, options, &mut ctx)
            .await
        {
            Ok((invocation, instance_id)) => {
                return Ok(response(invocation, &selection.backend.id, instance_id, &ctx));
            }
            Err(AttemptError::DeadlineExceeded) => {
                return Err(self.deadline_exceeded(&ctx, deadline));
            }
            Err(AttemptError::Failed) => {}
        }

        let catalog = self.registry.all();
        let fallbacks = plan_fallbacks(&ctx, &catalog, requirement, &self.tracker);
        tracing::debug!(
            request_id,
            primary = %ctx.primary,
            fallbacks = fallbacks.len(),
            "Primary failed, walking fallbacks"
        );

        for backend in fallbacks {
            if ctx.is_expired() {
                return Err(self.deadline_exceeded(&ctx, deadline));
            }

            self.events().emit(SwitchboardEvent::FallbackUsed {
                primary_id: ctx.primary.clone(),
                backend_id: backend.id.clone(),
                task,
                attempts_so_far: ctx.attempts,
                timestamp: Utc::now(),
            });
            ctx.fallback_to(&backend.id);

            match self.attempt_backend(&backend, prompt, options, &mut ctx).await {
                Ok((invocation, instance_id)) => {
                    tracing::info!(
                        request_id,
                        primary = %ctx.primary,
                        backend = %backend.id,
                        attempts = ctx.attempts,
                        "Fallback succeeded"
                    );
                    return Ok(response(invocation, &backend.id, instance_id, &ctx));
                }
                Err(AttemptError::Failed) => {
                    self.events().emit(SwitchboardEvent::FallbackFailed {
                        backend_id: backend.id.clone(),
                        error: ctx.last_error_or_default(),
                        timestamp: Utc::now(),
                    });
                }
                Err(AttemptError::DeadlineExceeded) => {
                    return Err(self.deadline_exceeded(&ctx, deadline));
                }
            }
        }

        let last_error = ctx.last_error_or_default();
        tracing::error!(
            request_id,
            task = %task,
            attempts = ctx.attempts,
            tried = ?ctx.tried,
            last_error = %last_error,
            "All backends exhausted"
        );
        self.events().emit(SwitchboardEvent::FallbackExhausted {
            task,
            attempts: ctx.attempts,
            last_error: last_error.clone(),
            timestamp: Utc::now(),
        });
        Err(DispatchError::AllBackendsExhausted {
            task,
            attempts: ctx.attempts,
            last_error,
        })
    }

    /// Invoke one backend, retrying per policy
    async fn attempt_backend(
        &self,
        backend: &Backend,
        prompt: &str,
        options: &RequestOptions,
        ctx: &mut FallbackContext,
    ) -> Result<(Invocation, String), AttemptError> {
        let retries = options.retries.unwrap_or(self.settings.retry.max_retries);
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);

        for attempt in 0..=retries {
            if attempt > 0 {
                let backoff = self.settings.retry.backoff_for_attempt(attempt - 1);
                tokio::time::sleep(ctx.attempt_budget(backoff)).await;
            }
            if ctx.is_expired() {
                return Err(AttemptError::DeadlineExceeded);
            }

            let instance_id = self.balancer.pick(backend);
            let budget = ctx.attempt_budget(timeout);
            ctx.record_attempt();
            self.metrics.attempts.inc();

            let began = Instant::now();
            let outcome = {
                let _active = self.balancer.begin(&backend.id, &instance_id);
                tokio::time::timeout(
                    budget,
                    self.invoker
                        .invoke(&backend.id, &instance_id, prompt, options),
                )
                .await
            };
            let elapsed_ms = began.elapsed().as_secs_f64() * 1000.0;

            let (error, recorded_ms) = match outcome {
                Ok(Ok(invocation)) => {
                    self.balancer
                        .record_request(&backend.id, &instance_id, elapsed_ms, true);
                    self.tracker.record_completion(
                        &backend.id,
                        Completion::success(elapsed_ms).with_tokens(invocation.tokens_used),
                    );
                    return Ok((invocation, instance_id));
                }
                Ok(Err(e)) => (e, elapsed_ms),
                Err(_) => (
                    InvokeError::Timeout {
                        timeout_ms: budget.as_millis() as u64,
                    },
                    budget.as_secs_f64() * 1000.0,
                ),
            };

            tracing::warn!(
                backend = %backend.id,
                instance = %instance_id,
                attempt = attempt + 1,
                error = %error,
                "Invocation failed"
            );
            self.balancer
                .record_request(&backend.id, &instance_id, recorded_ms, false);
            self.tracker.record_completion(
                &backend.id,
                Completion::failure(recorded_ms, error.to_string()),
            );
            ctx.record_failure(error.to_string());
        }

        Err(AttemptError::Failed)
    }

    fn deadline_exceeded(&self, ctx: &FallbackContext, deadline: Option<Duration>) -> DispatchError {
        let deadline_ms = deadline.map_or(0, |d| d.as_millis() as u64);
        tracing::error!(
            task = %ctx.task,
            attempts = ctx.attempts,
            deadline_ms,
            "Request deadline exceeded"
        );
        self.events().emit(SwitchboardEvent::FallbackExhausted {
            task: ctx.task,
            attempts: ctx.attempts,
            last_error: format!("deadline of {deadline_ms}ms exceeded"),
            timestamp: Utc::now(),
        });
        DispatchError::DeadlineExceeded {
            task: ctx.task,
            attempts: ctx.attempts,
            deadline_ms,
        }
    }
}

fn response(
    invocation: Invocation,
    backend_id: &str,
    instance_id: String,
    ctx: &FallbackContext,
) -> DispatchResponse {
    DispatchResponse {
        content: invocation.content,
        tokens_used: invocation.tokens_used,
        response_time_ms: invocation.response_time_ms,
        backend_id: backend_id.to_string(),
        instance_id,
        attempts: ctx.attempts,
        used_fallback: !ctx.is_original(),
    }
}

// ============================================================================
// Tests
// ============================================================================
