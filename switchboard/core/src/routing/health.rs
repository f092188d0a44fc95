//! Backend Health Tracking
//!
//! Consumes completion records per backend and maintains:
//! - Cumulative request, success, failure and token counters
//! - A bounded rolling history (latency statistics and trends come from it)
//! - A synthetic health score in `[0, 1]`
//! - A derived [`BackendStatus`] that gates selection
//! - Performance alerts when a threshold is crossed
//!
//! # Health Score
//!
//! ```text
//! score = 1.0
//!       - errorRate * 2                   (only when errorRate > 5%)
//!       - (avg/maxTime - 0.5) * 0.5       (only when avg > 50% of maxTime)
//!       + 0.1                             (only when total > 100)
//! clamped to [0, 1]
//! ```
//!
//! # Status Derivation
//!
//! ```text
//! errorRate > 0.5  -> Error
//! score     < 0.3  -> Error
//! score     < 0.7  -> Busy
//! otherwise        -> Available
//! ```
//!
//! `Offline` and `RateLimited` come from external signals, see
//! [`HealthTracker::set_external_status`].
//!
//! # Thread Safety
//!
//! Each backend's state lives behind its own mutex inside a `DashMap`, so
//! concurrent completions for one backend serialize without lost updates
//! while different backends never contend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::config::AlertThresholds;
use super::instances::{
    ActiveRequest, HealthCheckResult, InstanceHealth, InstanceMetrics, InstanceTable,
};
use crate::backend::HealthProbe;
use crate::events::{EventBus, SwitchboardEvent};

/// Completions kept per backend for latency statistics and trends
pub const MAX_HISTORY: usize = 1000;

/// Default look-back for [`HealthTracker::trend`]
pub const DEFAULT_TREND_WINDOW: Duration = Duration::from_secs(3600);

/// Samples required before a trend can be anything but stable
const TREND_MIN_SAMPLES: usize = 10;

/// Relative change in mean latency that counts as a trend
const TREND_THRESHOLD: f64 = 0.1;

/// Window for the requests-per-minute alert
const RATE_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Status
// ============================================================================

/// Availability of a backend as seen by the selector
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    #[default]
    Available,
    Busy,
    Error,
    Offline,
    RateLimited,
}

impl BackendStatus {
    /// Derive status from health score and error rate
    #[must_use]
    pub fn derive(health_score: f64, error_rate: f64) -> Self {
        if error_rate > 0.5 || health_score < 0.3 {
            Self::Error
        } else if health_score < 0.7 {
            Self::Busy
        } else {
            Self::Available
        }
    }

    /// Whether the selector may pick this backend
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Status a collaborator can impose on a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalStatus {
    Offline,
    RateLimited,
}

impl From<ExternalStatus> for BackendStatus {
    fn from(value: ExternalStatus) -> Self {
        match value {
            ExternalStatus::Offline => Self::Offline,
            ExternalStatus::RateLimited => Self::RateLimited,
        }
    }
}

/// Compute the health score
#[must_use]
pub fn health_score(
    error_rate: f64,
    average_response_time_ms: f64,
    total_requests: u64,
    max_response_time_ms: f64,
) -> f64 {
    let mut score = 1.0;

    if error_rate > 0.05 {
        score -= error_rate * 2.0;
    }

    if max_response_time_ms > 0.0 && average_response_time_ms > max_response_time_ms * 0.5 {
        score -= (average_response_time_ms / max_response_time_ms - 0.5) * 0.5;
    }

    if total_requests > 100 {
        score += 0.1;
    }

    score.clamp(0.0, 1.0)
}

// ============================================================================
// Metrics
// ============================================================================

/// Aggregate metrics for one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub backend_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean over positive latencies in the rolling history
    pub average_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub total_tokens: u64,
    pub average_tokens_per_request: f64,
    /// Cumulative `failed / total`
    pub error_rate: f64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub status: BackendStatus,
    pub health_score: f64,
}

impl BackendMetrics {
    fn seeded(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time_ms: 0.0,
            min_response_time_ms: 0.0,
            max_response_time_ms: 0.0,
            total_tokens: 0,
            average_tokens_per_request: 0.0,
            error_rate: 0.0,
            last_request_at: None,
            status: BackendStatus::Available,
            health_score: 1.0,
        }
    }

    /// `successful / total`, or `None` before the first completion
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_requests == 0 {
            None
        } else {
            Some(self.successful_requests as f64 / self.total_requests as f64)
        }
    }
}

/// Metrics of every tracked backend keyed by id
pub type MetricsSnapshot = HashMap<String, BackendMetrics>;

/// A finished invocation, as reported to the tracker
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub response_time_ms: f64,
    pub success: bool,
    pub tokens_used: Option<u64>,
    pub error: Option<String>,
}

impl Completion {
    #[must_use]
    pub fn success(response_time_ms: f64) -> Self {
        Self {
            response_time_ms,
            success: true,
            tokens_used: None,
            error: None,
        }
    }

    pub fn failure(response_time_ms: f64, error: impl Into<String>) -> Self {
        Self {
            response_time_ms,
            success: false,
            tokens_used: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    DegradedPerformance,
    HighErrorRate,
    SlowResponse,
    RateLimitExceeded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A threshold breach, with the metrics that triggered it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub backend_id: String,
    pub message: String,
    pub metrics: BackendMetrics,
    pub timestamp: DateTime<Utc>,
}

fn evaluate_alerts(
    metrics: &BackendMetrics,
    thresholds: &AlertThresholds,
    requests_last_minute: usize,
) -> Vec<Alert> {
    let id = &metrics.backend_id;
    let mut alerts = Vec::new();
    let mut raise = |kind, severity, message: String| {
        alerts.push(Alert {
            kind,
            severity,
            backend_id: id.clone(),
            message,
            metrics: metrics.clone(),
            timestamp: Utc::now(),
        });
    };

    if metrics.average_response_time_ms > thresholds.max_response_time_ms {
        raise(
            AlertKind::SlowResponse,
            AlertSeverity::Medium,
            format!(
                "Backend {id} average response time ({:.0}ms) exceeds threshold ({:.0}ms)",
                metrics.average_response_time_ms, thresholds.max_response_time_ms
            ),
        );
    }

    if metrics.error_rate > thresholds.max_error_rate {
        raise(
            AlertKind::HighErrorRate,
            AlertSeverity::High,
            format!(
                "Backend {id} error rate ({:.1}%) exceeds threshold ({:.1}%)",
                metrics.error_rate * 100.0,
                thresholds.max_error_rate * 100.0
            ),
        );
    }

    if metrics.health_score < thresholds.min_health_score {
        let severity = if metrics.health_score < 0.5 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::High
        };
        raise(
            AlertKind::DegradedPerformance,
            severity,
            format!(
                "Backend {id} health score ({:.1}%) below threshold ({:.1}%)",
                metrics.health_score * 100.0,
                thresholds.min_health_score * 100.0
            ),
        );
    }

    if requests_last_minute > thresholds.max_requests_per_minute as usize {
        raise(
            AlertKind::RateLimitExceeded,
            AlertSeverity::Low,
            format!(
                "Backend {id} handled {requests_last_minute} requests in the last minute (limit {})",
                thresholds.max_requests_per_minute
            ),
        );
    }

    alerts
}

// ============================================================================
// Trends
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Degrading,
    Stable,
}

/// Windowed view of a backend's recent history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTrend {
    pub backend_id: String,
    pub request_count: usize,
    pub average_response_time_ms: f64,
    pub error_rate: f64,
    pub direction: TrendDirection,
}

/// Compare mean latency of the first and second half of `samples`
#[must_use]
pub fn trend_direction(samples: &[f64]) -> TrendDirection {
    if samples.len() < TREND_MIN_SAMPLES {
        return TrendDirection::Stable;
    }

    let mid = samples.len() / 2;
    let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
    let first = mean(&samples[..mid]);
    let second = mean(&samples[mid..]);

    if first <= 0.0 {
        return if second > 0.0 {
            TrendDirection::Degrading
        } else {
            TrendDirection::Stable
        };
    }

    let improvement = (first - second) / first;
    if improvement > TREND_THRESHOLD {
        TrendDirection::Improving
    } else if improvement < -TREND_THRESHOLD {
        TrendDirection::Degrading
    } else {
        TrendDirection::Stable
    }
}

// ============================================================================
// Per-Backend State
// ============================================================================

#[derive(Clone, Debug)]
struct HistoryEntry {
    at: Instant,
    response_time_ms: f64,
    success: bool,
}

#[derive(Debug)]
struct BackendState {
    metrics: BackendMetrics,
    history: VecDeque<HistoryEntry>,
    external: Option<ExternalStatus>,
}

impl BackendState {
    fn new(backend_id: &str) -> Self {
        Self {
            metrics: BackendMetrics::seeded(backend_id),
            history: VecDeque::with_capacity(64),
            external: None,
        }
    }

    fn apply(&mut self, completion: &Completion, now: Instant, max_response_time_ms: f64) {
        self.history.push_back(HistoryEntry {
            at: now,
            response_time_ms: completion.response_time_ms,
            success: completion.success,
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }

        let m = &mut self.metrics;
        m.total_requests += 1;
        if completion.success {
            m.successful_requests += 1;
        } else {
            m.failed_requests += 1;
        }

        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = 0.0_f64;
        for rt in self
            .history
            .iter()
            .map(|e| e.response_time_ms)
            .filter(|rt| *rt > 0.0)
        {
            count += 1;
            sum += rt;
            min = min.min(rt);
            max = max.max(rt);
        }
        if count > 0 {
            m.average_response_time_ms = sum / count as f64;
            m.min_response_time_ms = min;
            m.max_response_time_ms = max;
        } else {
            m.average_response_time_ms = 0.0;
            m.min_response_time_ms = 0.0;
            m.max_response_time_ms = 0.0;
        }

        m.total_tokens += completion.tokens_used.unwrap_or(0);
        m.average_tokens_per_request = m.total_tokens as f64 / m.total_requests as f64;
        m.error_rate = m.failed_requests as f64 / m.total_requests as f64;
        m.last_request_at = Some(Utc::now());
        m.health_score = health_score(
            m.error_rate,
            m.average_response_time_ms,
            m.total_requests,
            max_response_time_ms,
        );
        m.status = BackendStatus::derive(m.health_score, m.error_rate);
    }

    fn recent(&self, window: Duration, now: Instant) -> impl Iterator<Item = &HistoryEntry> {
        let cutoff = now.checked_sub(window);
        self.history
            .iter()
            .filter(move |e| cutoff.map_or(true, |c| e.at >= c))
    }

    fn effective_status(&self) -> BackendStatus {
        self.external.map_or(self.metrics.status, BackendStatus::from)
    }

    fn snapshot(&self) -> BackendMetrics {
        let mut metrics = self.metrics.clone();
        metrics.status = self.effective_status();
        metrics
    }
}

// ============================================================================
// Health Tracker
// ============================================================================

/// Tracks backend and instance health
///
/// Owns all mutable performance state; the selector and balancer only read
/// snapshots of it.
pub struct HealthTracker {
    backends: DashMap<String, Arc<Mutex<BackendState>>>,
    /// Registration order, for stable listings
    order: RwLock<Vec<String>>,
    instances: InstanceTable,
    thresholds: RwLock<AlertThresholds>,
    events: EventBus,
}

impl HealthTracker {
    /// Create a tracker that reports alerts on `events`
    #[must_use]
    pub fn new(thresholds: AlertThresholds, events: EventBus) -> Self {
        Self {
            backends: DashMap::new(),
            order: RwLock::new(Vec::new()),
            instances: InstanceTable::new(),
            thresholds: RwLock::new(thresholds),
            events,
        }
    }

    /// Start tracking a backend with zeroed metrics (re-seeds a known one)
    pub fn register_backend(&self, backend_id: &str) {
        self.backends.insert(
            backend_id.to_string(),
            Arc::new(Mutex::new(BackendState::new(backend_id))),
        );
        let mut order = self.order.write();
        if !order.iter().any(|id| id == backend_id) {
            order.push(backend_id.to_string());
        }
    }

    /// Whether a backend is tracked
    #[must_use]
    pub fn is_registered(&self, backend_id: &str) -> bool {
        self.backends.contains_key(backend_id)
    }

    fn state(&self, backend_id: &str) -> Option<Arc<Mutex<BackendState>>> {
        self.backends.get(backend_id).map(|s| s.clone())
    }

    /// Record a completion and return the alerts it raised
    ///
    /// Alerts are also broadcast as [`SwitchboardEvent::PerformanceAlert`];
    /// a critical one additionally broadcasts [`SwitchboardEvent::BackendDegraded`].
    pub fn record_completion(&self, backend_id: &str, completion: Completion) -> Vec<Alert> {
        let Some(state) = self.state(backend_id) else {
            tracing::warn!(backend = %backend_id, "Completion for untracked backend ignored");
            return Vec::new();
        };
        let thresholds = self.thresholds.read().clone();

        let alerts = {
            let now = Instant::now();
            let mut state = state.lock();
            state.apply(&completion, now, thresholds.max_response_time_ms);
            let last_minute = state.recent(RATE_WINDOW, now).count();
            evaluate_alerts(&state.metrics, &thresholds, last_minute)
        };

        if let Some(error) = &completion.error {
            tracing::debug!(
                backend = %backend_id,
                response_time_ms = completion.response_time_ms,
                error = %error,
                "Recorded failed completion"
            );
        }

        for alert in &alerts {
            tracing::warn!(
                backend = %backend_id,
                kind = ?alert.kind,
                severity = ?alert.severity,
                "{}",
                alert.message
            );
            self.events.emit(SwitchboardEvent::PerformanceAlert {
                alert: alert.clone(),
                timestamp: alert.timestamp,
            });
            if alert.severity == AlertSeverity::Critical {
                self.events.emit(SwitchboardEvent::BackendDegraded {
                    backend_id: backend_id.to_string(),
                    health_score: alert.metrics.health_score,
                    timestamp: alert.timestamp,
                });
            }
        }

        alerts
    }

    /// Snapshot one backend's metrics
    #[must_use]
    pub fn metrics(&self, backend_id: &str) -> Option<BackendMetrics> {
        self.state(backend_id).map(|s| s.lock().snapshot())
    }

    /// Snapshot every backend's metrics in registration order
    #[must_use]
    pub fn all_metrics(&self) -> Vec<BackendMetrics> {
        let order = self.order.read().clone();
        order.iter().filter_map(|id| self.metrics(id)).collect()
    }

    /// Snapshot every backend's metrics keyed by id
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.backends
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().snapshot()))
            .collect()
    }

    /// Current status; untracked backends are offline
    #[must_use]
    pub fn status(&self, backend_id: &str) -> BackendStatus {
        self.state(backend_id)
            .map_or(BackendStatus::Offline, |s| s.lock().effective_status())
    }

    /// Whether the backend may be selected
    #[must_use]
    pub fn is_available(&self, backend_id: &str) -> bool {
        self.status(backend_id).is_available()
    }

    /// Impose a status until cleared; returns false for untracked backends
    pub fn set_external_status(&self, backend_id: &str, status: ExternalStatus) -> bool {
        let Some(state) = self.state(backend_id) else {
            return false;
        };
        state.lock().external = Some(status);
        tracing::info!(backend = %backend_id, status = ?status, "External status set");
        true
    }

    /// Drop an imposed status, returning to the derived one
    pub fn clear_external_status(&self, backend_id: &str) {
        if let Some(state) = self.state(backend_id) {
            state.lock().external = None;
        }
    }

    /// Whether a backend was marked offline by a collaborator
    #[must_use]
    pub fn is_externally_offline(&self, backend_id: &str) -> bool {
        self.state(backend_id)
            .is_some_and(|s| s.lock().external == Some(ExternalStatus::Offline))
    }

    /// Summarize the history within `window` and classify its latency trend
    #[must_use]
    pub fn trend(&self, backend_id: &str, window: Duration) -> PerformanceTrend {
        let empty = PerformanceTrend {
            backend_id: backend_id.to_string(),
            request_count: 0,
            average_response_time_ms: 0.0,
            error_rate: 0.0,
            direction: TrendDirection::Stable,
        };
        let Some(state) = self.state(backend_id) else {
            return empty;
        };

        let state = state.lock();
        let recent: Vec<&HistoryEntry> = state.recent(window, Instant::now()).collect();
        if recent.is_empty() {
            return empty;
        }

        let positive: Vec<f64> = recent
            .iter()
            .map(|e| e.response_time_ms)
            .filter(|rt| *rt > 0.0)
            .collect();
        let average_response_time_ms = if positive.is_empty() {
            0.0
        } else {
            positive.iter().sum::<f64>() / positive.len() as f64
        };
        let failures = recent.iter().filter(|e| !e.success).count();
        let samples: Vec<f64> = recent.iter().map(|e| e.response_time_ms).collect();

        PerformanceTrend {
            backend_id: backend_id.to_string(),
            request_count: recent.len(),
            average_response_time_ms,
            error_rate: failures as f64 / recent.len() as f64,
            direction: trend_direction(&samples),
        }
    }

    /// Zero a backend's metrics and history; returns false if untracked
    pub fn reset(&self, backend_id: &str) -> bool {
        let Some(state) = self.state(backend_id) else {
            return false;
        };
        let mut state = state.lock();
        let external = state.external;
        *state = BackendState::new(backend_id);
        state.external = external;
        true
    }

    /// Current alert thresholds
    #[must_use]
    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds.read().clone()
    }

    /// Replace alert thresholds; applies from the next completion
    pub fn set_thresholds(&self, thresholds: AlertThresholds) {
        *self.thresholds.write() = thresholds;
    }

    /// The event bus alerts are emitted on
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------------

    /// Per-instance metrics table
    #[must_use]
    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    /// Record a completion against one instance
    pub fn record_instance_request(
        &self,
        backend_id: &str,
        instance_id: &str,
        response_time_ms: f64,
        success: bool,
    ) {
        self.instances
            .record(backend_id, instance_id, response_time_ms, success);
    }

    /// Count a request as active on an instance until the guard drops
    pub fn begin_instance_request(&self, backend_id: &str, instance_id: &str) -> ActiveRequest {
        self.instances.begin(backend_id, instance_id)
    }

    /// Snapshot of every known instance of a backend
    #[must_use]
    pub fn instance_metrics(&self, backend_id: &str) -> Vec<InstanceMetrics> {
        self.instances.for_backend(backend_id)
    }

    /// Probe one instance and store the reading
    ///
    /// A failed probe is recorded as an unhealthy reading with error rate
    /// 1.0; the error is reported in the result, never returned.
    pub async fn instance_health_check(
        &self,
        backend_id: &str,
        instance_id: &str,
        probe: &dyn HealthProbe,
    ) -> HealthCheckResult {
        let (health, error) = match probe.probe(backend_id, instance_id).await {
            Ok(health) => (health, None),
            Err(e) => {
                tracing::warn!(
                    backend = %backend_id,
                    instance = %instance_id,
                    error = %e,
                    "Health probe failed, marking instance unhealthy"
                );
                (InstanceHealth::unreachable(), Some(e.to_string()))
            }
        };

        self.instances
            .update_health(backend_id, instance_id, health.clone());

        HealthCheckResult {
            backend_id: backend_id.to_string(),
            instance_id: instance_id.to_string(),
            health,
            error,
            timestamp: Utc::now(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(AlertThresholds::default(), EventBus::default())
    }
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("backends", &self.backends.len())
            .field("thresholds", &*self.thresholds.read())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
