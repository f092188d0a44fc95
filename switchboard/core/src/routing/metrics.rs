//! Dispatch Metrics
//!
//! Lock-free counters and a latency histogram kept by the dispatcher:
//! - Request outcomes (succeeded, exhausted, no suitable backend)
//! - Fallback usage and invocation attempts
//! - Deduplicated requests
//! - End-to-end latency distribution
//!
//! Per-backend health lives in the health tracker; these numbers describe
//! the dispatcher itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds (in the unit being measured)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Total count
    total_count: AtomicU64,
    /// Sum of all values
    sum: AtomicU64,
    /// Minimum value seen
    min: AtomicU64,
    /// Maximum value seen
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    ///
    /// Values above the last bound land in the last bucket.
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let buckets = if buckets.is_empty() {
            vec![f64::MAX]
        } else {
            buckets
        };
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Create with default latency buckets (in milliseconds)
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        let last = self.buckets.len() - 1;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(last);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value_u64 = value.max(0.0) as u64;
        self.sum.fetch_add(value_u64, Ordering::Relaxed);
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Get histogram snapshot
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max,
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    #[must_use]
    pub fn p90(&self) -> f64 {
        self.percentile(0.9)
    }

    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Dispatch Metrics
// ============================================================================

/// Dispatcher-level counters
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Requests that reached backend dispatch (deduplicated followers excluded)
    pub requests: Counter,
    pub succeeded: Counter,
    /// Requests rejected because nothing passed the hard filters
    pub no_suitable_backend: Counter,
    /// Requests that ran out of backends or time
    pub exhausted: Counter,
    /// Requests answered by a fallback backend
    pub fallbacks_used: Counter,
    /// Invocations made, retries included
    pub attempts: Counter,
    /// Requests that joined an identical in-flight request
    pub deduplicated: Counter,
    /// End-to-end latency of dispatched requests (ms)
    pub latency: Histogram,
    started_at: Instant,
}

impl DispatchMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests: Counter::new(),
            succeeded: Counter::new(),
            no_suitable_backend: Counter::new(),
            exhausted: Counter::new(),
            fallbacks_used: Counter::new(),
            attempts: Counter::new(),
            deduplicated: Counter::new(),
            latency: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Time since the dispatcher was created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn summary(&self) -> DispatchMetricsSummary {
        let latency = self.latency.snapshot();
        DispatchMetricsSummary {
            uptime_secs: self.uptime().as_secs(),
            requests: self.requests.get(),
            succeeded: self.succeeded.get(),
            no_suitable_backend: self.no_suitable_backend.get(),
            exhausted: self.exhausted.get(),
            fallbacks_used: self.fallbacks_used.get(),
            attempts: self.attempts.get(),
            deduplicated: self.deduplicated.get(),
            latency_mean_ms: latency.mean,
            latency_p50_ms: latency.p50(),
            latency_p90_ms: latency.p90(),
            latency_p99_ms: latency.p99(),
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`DispatchMetrics`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatchMetricsSummary {
    pub uptime_secs: u64,
    pub requests: u64,
    pub succeeded: u64,
    pub no_suitable_backend: u64,
    pub exhausted: u64,
    pub fallbacks_used: u64,
    pub attempts: u64,
    pub deduplicated: u64,
    pub latency_mean_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p99_ms: f64,
}
