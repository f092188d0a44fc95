//! Instance Load Balancing
//!
//! Once the selector has chosen a backend, the balancer picks which of its
//! instances serves the request.
//!
//! # Strategies
//!
//! ```text
//! RoundRobin        per-backend atomic counter mod instance count
//! Weighted          random pick proportional to configured weights
//!                   (unweighted instances count 1, weight 0 drains)
//! PerformanceBased  highest load x latency x error x health score
//! ```
//!
//! A backend without instances is its own endpoint; a backend with one
//! instance always gets that instance. Weighted without any configured
//! weight, and performance-based without any instance metrics, both fall
//! back to round-robin.
//!
//! Instance metrics are owned by the [`HealthTracker`]; the balancer reads
//! them for scoring and writes completions back through it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;

use super::config::{BalancingConfig, BalancingStrategy};
use super::health::HealthTracker;
use super::instances::{ActiveRequest, InstanceHealth, InstanceMetrics, InstanceStatus};
use super::registry::Backend;

/// Active requests at which the load factor bottoms out
const LOAD_SCALE: f64 = 10.0;

/// Average latency (ms) at which the latency factor bottoms out
const LATENCY_SCALE_MS: f64 = 5000.0;

/// Floor for every performance factor
const FACTOR_FLOOR: f64 = 0.1;

/// Aggregate view over every balanced backend
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoadBalancingStats {
    pub total_families: usize,
    pub total_instances: usize,
    pub avg_instances_per_family: f64,
    pub unhealthy_instances: usize,
    pub total_active_requests: u64,
}

/// Performance score of one instance
#[must_use]
pub fn instance_score(metrics: &InstanceMetrics) -> f64 {
    let load = (1.0 - f64::from(metrics.active_requests) / LOAD_SCALE).max(FACTOR_FLOOR);
    let latency = (1.0 - metrics.average_response_time_ms / LATENCY_SCALE_MS).max(FACTOR_FLOOR);
    let errors = (1.0 - metrics.error_rate).max(FACTOR_FLOOR);
    load * latency * errors * metrics.health.status.score_factor()
}

/// Picks instances and feeds instance completions back to the tracker
pub struct Balancer {
    config: RwLock<BalancingConfig>,
    counters: DashMap<String, AtomicUsize>,
    tracker: Arc<HealthTracker>,
}

impl Balancer {
    #[must_use]
    pub fn new(config: BalancingConfig, tracker: Arc<HealthTracker>) -> Self {
        Self {
            config: RwLock::new(config),
            counters: DashMap::new(),
            tracker,
        }
    }

    /// Current strategy
    #[must_use]
    pub fn strategy(&self) -> BalancingStrategy {
        self.config.read().strategy
    }

    /// Switch strategy for subsequent picks
    pub fn set_strategy(&self, strategy: BalancingStrategy) {
        self.config.write().strategy = strategy;
    }

    /// Replace the instance weight map
    pub fn set_weights(&self, weights: impl IntoIterator<Item = (String, u32)>) {
        self.config.write().weights = weights.into_iter().collect();
    }

    /// Snapshot of the balancing configuration
    #[must_use]
    pub fn config(&self) -> BalancingConfig {
        self.config.read().clone()
    }

    /// Pick an instance with the configured strategy
    #[must_use]
    pub fn pick(&self, backend: &Backend) -> String {
        self.pick_with(backend, self.strategy())
    }

    /// Pick an instance with an explicit strategy
    #[must_use]
    pub fn pick_with(&self, backend: &Backend, strategy: BalancingStrategy) -> String {
        match backend.instances.as_slice() {
            [] => return backend.id.clone(),
            [only] => return only.id.clone(),
            _ => {}
        }

        let picked = match strategy {
            BalancingStrategy::RoundRobin => self.round_robin(backend),
            BalancingStrategy::Weighted => self.weighted(backend),
            BalancingStrategy::PerformanceBased => self.performance_based(backend),
        };
        tracing::debug!(
            backend = %backend.id,
            instance = %picked,
            strategy = %strategy,
            "Picked instance"
        );
        picked
    }

    fn round_robin(&self, backend: &Backend) -> String {
        let n = backend.instances.len();
        let ticket = match self.counters.get(&backend.id) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed),
            None => self
                .counters
                .entry(backend.id.clone())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };
        backend.instances[ticket % n].id.clone()
    }

    fn weighted(&self, backend: &Backend) -> String {
        let weights: Vec<u32> = {
            let config = self.config.read();
            if !backend
                .instances
                .iter()
                .any(|i| config.weights.contains_key(&i.id))
            {
                drop(config);
                return self.round_robin(backend);
            }
            backend
                .instances
                .iter()
                .map(|i| config.weights.get(&i.id).copied().unwrap_or(1))
                .collect()
        };

        let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
        if total == 0 {
            tracing::warn!(backend = %backend.id, "Every instance drained, using round-robin");
            return self.round_robin(backend);
        }

        let mut roll = rand::thread_rng().gen_range(0..total);
        for (instance, weight) in backend.instances.iter().zip(&weights) {
            let weight = u64::from(*weight);
            if roll < weight {
                return instance.id.clone();
            }
            roll -= weight;
        }
        self.round_robin(backend)
    }

    fn performance_based(&self, backend: &Backend) -> String {
        let table = self.tracker.instances();
        let metrics: Vec<Option<InstanceMetrics>> = backend
            .instances
            .iter()
            .map(|i| table.get(&backend.id, &i.id))
            .collect();

        if metrics.iter().all(Option::is_none) {
            return self.round_robin(backend);
        }

        let mut best: Option<(&str, f64)> = None;
        for (instance, metrics) in backend.instances.iter().zip(&metrics) {
            let score = metrics.as_ref().map_or(1.0, instance_score);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((&instance.id, score));
            }
        }
        match best {
            Some((id, _)) => id.to_string(),
            None => self.round_robin(backend),
        }
    }

    /// Record a completed request against an instance
    pub fn record_request(
        &self,
        backend_id: &str,
        instance_id: &str,
        response_time_ms: f64,
        success: bool,
    ) {
        self.tracker
            .record_instance_request(backend_id, instance_id, response_time_ms, success);
    }

    /// Count a request as active on an instance until the guard drops
    #[must_use]
    pub fn begin(&self, backend_id: &str, instance_id: &str) -> ActiveRequest {
        self.tracker.begin_instance_request(backend_id, instance_id)
    }

    /// Replace an instance's health reading, creating its entry if needed
    pub fn update_instance_health(
        &self,
        backend_id: &str,
        instance_id: &str,
        health: InstanceHealth,
    ) {
        self.tracker
            .instances()
            .update_health(backend_id, instance_id, health);
    }

    /// Instance metrics of one backend
    #[must_use]
    pub fn instance_metrics(&self, backend_id: &str) -> Vec<InstanceMetrics> {
        self.tracker.instance_metrics(backend_id)
    }

    /// Aggregate stats over a catalog
    #[must_use]
    pub fn stats(&self, catalog: &[Arc<Backend>]) -> LoadBalancingStats {
        let table = self.tracker.instances();
        let mut stats = LoadBalancingStats {
            total_families: catalog.len(),
            ..Default::default()
        };

        for backend in catalog {
            for instance_id in backend.endpoint_ids() {
                stats.total_instances += 1;
                if let Some(m) = table.get(&backend.id, &instance_id) {
                    if m.health.status == InstanceStatus::Unhealthy {
                        stats.unhealthy_instances += 1;
                    }
                    stats.total_active_requests += u64::from(m.active_requests);
                }
            }
        }

        if stats.total_families > 0 {
            stats.avg_instances_per_family =
                stats.total_instances as f64 / stats.total_families as f64;
        }
        stats
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("config", &*self.config.read())
            .field("families", &self.counters.len())
            .finish_non_exhaustive()
    }
}
