//! Shared fixtures for the dispatcher integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use switchboard_core::{
    Backend, CapabilitySet, HealthProbe, Instance, InstanceHealth, Invocation, InvokeError,
    Invoker, ProbeError, RequestOptions,
};

/// Invoker whose behaviour per backend is scripted by the test
#[derive(Clone, Default)]
pub struct ScriptedInvoker {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    latency: Arc<Mutex<HashMap<String, Duration>>>,
    failure_rate: Arc<Mutex<Option<(f64, StdRng)>>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, backend_id: &str) {
        self.failing.lock().insert(backend_id.to_string());
    }

    pub fn recover(&self, backend_id: &str) {
        self.failing.lock().remove(backend_id);
    }

    pub fn delay(&self, backend_id: &str, latency: Duration) {
        self.latency.lock().insert(backend_id.to_string(), latency);
    }

    /// Fail a seeded random fraction of every invocation
    pub fn random_failures(&self, rate: f64, seed: u64) {
        *self.failure_rate.lock() = Some((rate, StdRng::seed_from_u64(seed)));
    }

    /// Backend ids in call order
    pub fn backends_called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(b, _)| b.clone()).collect()
    }

    /// Instance ids in call order
    pub fn instances_called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, i)| i.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        backend_id: &str,
        instance_id: &str,
        prompt: &str,
        _options: &RequestOptions,
    ) -> Result<Invocation, InvokeError> {
        self.calls
            .lock()
            .push((backend_id.to_string(), instance_id.to_string()));

        let latency = self.latency.lock().get(backend_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing.lock().contains(backend_id) {
            return Err(InvokeError::Unavailable(format!("{backend_id} refused")));
        }
        let unlucky = match self.failure_rate.lock().as_mut() {
            Some((rate, rng)) => rng.gen_bool(*rate),
            None => false,
        };
        if unlucky {
            return Err(InvokeError::Failed(format!("{backend_id} flaked")));
        }

        Ok(Invocation {
            content: format!("{backend_id}: {prompt}"),
            tokens_used: 10,
            response_time_ms: latency.map_or(1, |l| l.as_millis() as u64),
        })
    }
}

/// Probe that reports instances healthy unless marked down
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    down: Arc<Mutex<HashSet<String>>>,
    probes: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_down(&self, instance_id: &str) {
        self.down.lock().insert(instance_id.to_string());
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(
        &self,
        _backend_id: &str,
        instance_id: &str,
    ) -> Result<InstanceHealth, ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.down.lock().contains(instance_id) {
            Err(ProbeError::Unreachable(instance_id.to_string()))
        } else {
            Ok(InstanceHealth::healthy(12.0))
        }
    }
}

/// A backend with every capability
pub fn general(id: &str) -> Backend {
    Backend::new(id, id)
        .with_capabilities(CapabilitySet::all())
        .with_context_window(32_000)
        .with_response_time_ms(1500)
}

/// A backend with every capability and the given instances
pub fn pooled(id: &str, instances: &[&str]) -> Backend {
    instances
        .iter()
        .fold(general(id), |b, i| b.with_instance(Instance::new(*i)))
}
