//! Instance Metrics
//!
//! Per-instance load and health state. The health tracker owns the table;
//! the balancer reads it to score instances and writes completions back
//! through [`InstanceTable::record`].
//!
//! Each instance's metrics sit behind their own mutex, so updates to one
//! instance serialize while different instances proceed in parallel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ============================================================================
// Instance Health
// ============================================================================

/// Probe-reported condition of an instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl InstanceStatus {
    /// Multiplier applied to an instance's performance score
    #[must_use]
    pub fn score_factor(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.7,
            Self::Unhealthy => 0.1,
        }
    }
}

/// Result of the most recent health probe of an instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub status: InstanceStatus,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub last_check: DateTime<Utc>,
}

impl InstanceHealth {
    /// A healthy reading taken now
    #[must_use]
    pub fn healthy(response_time_ms: f64) -> Self {
        Self {
            status: InstanceStatus::Healthy,
            response_time_ms,
            error_rate: 0.0,
            last_check: Utc::now(),
        }
    }

    /// The reading recorded when a probe could not reach the instance
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            status: InstanceStatus::Unhealthy,
            response_time_ms: 0.0,
            error_rate: 1.0,
            last_check: Utc::now(),
        }
    }
}

impl Default for InstanceHealth {
    fn default() -> Self {
        Self::healthy(0.0)
    }
}

/// Outcome of probing one instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub instance_id: String,
    pub health: InstanceHealth,
    /// Probe error, when the instance was marked unhealthy because the probe failed
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Instance Metrics
// ============================================================================

/// Load and performance counters for one instance of a backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub instance_id: String,
    pub backend_id: String,
    /// Requests currently in flight
    pub active_requests: u32,
    pub total_requests: u64,
    /// Running cumulative mean
    pub average_response_time_ms: f64,
    /// Running cumulative failure fraction
    pub error_rate: f64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub health: InstanceHealth,
}

impl InstanceMetrics {
    fn new(backend_id: &str, instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            backend_id: backend_id.to_string(),
            active_requests: 0,
            total_requests: 0,
            average_response_time_ms: 0.0,
            error_rate: 0.0,
            last_request_at: None,
            health: InstanceHealth::default(),
        }
    }

    fn record(&mut self, response_time_ms: f64, success: bool) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        let failed = if success { 0.0 } else { 1.0 };
        self.error_rate = (self.error_rate * (n - 1.0) + failed) / n;
        self.average_response_time_ms =
            (self.average_response_time_ms * (n - 1.0) + response_time_ms) / n;
        self.last_request_at = Some(Utc::now());
    }
}

// ============================================================================
// Active Request Guard
// ============================================================================

/// Counts a request as active on its instance until dropped
#[derive(Debug)]
pub struct ActiveRequest {
    entry: Arc<Mutex<InstanceMetrics>>,
}

impl ActiveRequest {
    fn start(entry: Arc<Mutex<InstanceMetrics>>) -> Self {
        entry.lock().active_requests += 1;
        Self { entry }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        let mut metrics = self.entry.lock();
        metrics.active_requests = metrics.active_requests.saturating_sub(1);
    }
}

// ============================================================================
// Instance Table
// ============================================================================

type InstanceKey = (String, String);

/// Concurrent map of `(backend_id, instance_id)` to instance metrics
#[derive(Debug, Default)]
pub struct InstanceTable {
    entries: DashMap<InstanceKey, Arc<Mutex<InstanceMetrics>>>,
}

impl InstanceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, backend_id: &str, instance_id: &str) -> Arc<Mutex<InstanceMetrics>> {
        let key = (backend_id.to_string(), instance_id.to_string());
        if let Some(existing) = self.entries.get(&key) {
            return existing.clone();
        }
        self.entries
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(InstanceMetrics::new(backend_id, instance_id))))
            .clone()
    }

    /// Record a completed request against an instance
    pub fn record(&self, backend_id: &str, instance_id: &str, response_time_ms: f64, success: bool) {
        self.entry(backend_id, instance_id)
            .lock()
            .record(response_time_ms, success);
    }

    /// Mark a request as active on an instance
    pub fn begin(&self, backend_id: &str, instance_id: &str) -> ActiveRequest {
        ActiveRequest::start(self.entry(backend_id, instance_id))
    }

    /// Replace the health reading of an instance, creating its entry if needed
    pub fn update_health(&self, backend_id: &str, instance_id: &str, health: InstanceHealth) {
        self.entry(backend_id, instance_id).lock().health = health;
    }

    /// Snapshot one instance
    #[must_use]
    pub fn get(&self, backend_id: &str, instance_id: &str) -> Option<InstanceMetrics> {
        let key = (backend_id.to_string(), instance_id.to_string());
        self.entries.get(&key).map(|e| e.lock().clone())
    }

    /// Snapshot every known instance of a backend, ordered by instance id
    #[must_use]
    pub fn for_backend(&self, backend_id: &str) -> Vec<InstanceMetrics> {
        let mut out: Vec<InstanceMetrics> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == backend_id)
            .map(|e| e.value().lock().clone())
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    /// Snapshot every instance, ordered by backend then instance id
    #[must_use]
    pub fn all(&self) -> Vec<InstanceMetrics> {
        let mut out: Vec<InstanceMetrics> =
            self.entries.iter().map(|e| e.value().lock().clone()).collect();
        out.sort_by(|a, b| {
            (a.backend_id.as_str(), a.instance_id.as_str())
                .cmp(&(b.backend_id.as_str(), b.instance_id.as_str()))
        });
        out
    }

    /// Whether any instance of a backend has metrics
    #[must_use]
    pub fn has_backend(&self, backend_id: &str) -> bool {
        self.entries.iter().any(|e| e.key().0 == backend_id)
    }

    /// Forget every instance of a backend
    pub fn remove_backend(&self, backend_id: &str) {
        self.entries.retain(|key, _| key.0 != backend_id);
    }
}
