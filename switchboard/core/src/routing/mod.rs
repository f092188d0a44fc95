#![allow(missing_docs)]
//! Backend Selection and Dispatch
//!
//! Chooses a backend for each request, spreads load across its instances,
//! tracks health from real outcomes, and falls back when a backend fails.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |    Dispatcher    |  <-- Entry point for all requests (dedup, retry, fallback)
//! +--------+---------+
//!          |
//!          v
//! +------------------+      +------------------+
//! |     Selector     | <--- |  HealthTracker   |  <-- Metrics, status, alerts
//! +--------+---------+      +--------+---------+
//!          |                         ^
//!          v                         |
//! +------------------+               |
//! |     Balancer     |  <-- Picks an instance of the chosen backend
//! +--------+---------+               |
//!          |                         |
//!          v                         |
//! +------------------+               |
//! |     Invoker      | --------------+  <-- Supplied by the embedding application
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Hard Filters First**: Backends that cannot serve a request are never scored
//! 2. **Health From Outcomes**: Every invocation feeds the tracker, success or not
//! 3. **Graceful Degradation**: Fallbacks in catalog order when the chosen backend fails
//! 4. **Observability**: Every decision is logged and published on the event bus

pub mod balancer;
pub mod config;
pub mod fallback;
pub mod health;
pub mod inflight;
pub mod instances;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use balancer::{Balancer, LoadBalancingStats};
pub use config::*;
pub use fallback::{plan_fallbacks, FallbackContext};
pub use health::{
    Alert, AlertKind, AlertSeverity, BackendMetrics, BackendStatus, Completion, ExternalStatus,
    HealthTracker, MetricsSnapshot, PerformanceTrend, TrendDirection,
};
pub use inflight::fingerprint;
pub use instances::{HealthCheckResult, InstanceHealth, InstanceMetrics, InstanceStatus};
pub use metrics::DispatchMetricsSummary;
pub use policy::{
    CostCeiling, InvalidRequirement, PerformanceFloor, ScoreBreakdown, ScoredBackend,
    SelectionRequirement, SelectionResult, Selector,
};
pub use registry::{
    Backend, Instance, ModelType, Provider, ProviderType, RateLimits, Registry, RegistryError,
    Tier,
};
pub use router::*;
