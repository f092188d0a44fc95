//! Dispatch Test Utilities
//!
//! Mock infrastructure for exercising the dispatcher without real backends.
//! [`MockInvoker`] answers for any backend id and supports:
//! - Request history tracking for verification
//! - Backend failure toggling for fallback testing
//! - Per-backend latency for timeout and deadline testing
//! - Transient failures for retry testing
//!
//! # Usage
//!
//! ```ignore
//! let invoker = MockInvoker::new();
//!
//! // Simulate backend failure for fallback testing
//! invoker.set_failing("gpt-4");
//!
//! // After the test, verify which backends were called
//! assert_call_order(&invoker, &["gpt-4", "claude-3"]);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::config::CapabilitySet;
use super::instances::InstanceHealth;
use super::registry::Backend;
use crate::backend::{
    HealthProbe, Invocation, InvokeError, Invoker, ProbeError, RequestOptions,
};

// ============================================================================
// Request Tracking
// ============================================================================

/// Record of one invocation made to the mock
#[derive(Clone, Debug)]
pub struct InvocationRecord {
    pub backend_id: String,
    pub instance_id: String,
    pub prompt: String,
    pub timestamp: Instant,
}

// ============================================================================
// Mock Invoker
// ============================================================================

/// Invoker that echoes prompts and fails on demand
///
/// Clones share state, so a test can keep a handle after giving the
/// dispatcher its own.
#[derive(Clone, Default)]
pub struct MockInvoker {
    history: Arc<Mutex<Vec<InvocationRecord>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    transient: Arc<Mutex<HashMap<String, u32>>>,
    latencies: Arc<Mutex<HashMap<String, Duration>>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation of `backend_id` fails
    pub fn set_failing(&self, backend_id: &str) {
        self.failing.lock().unwrap().insert(backend_id.to_string());
    }

    /// Undo [`MockInvoker::set_failing`] and any pending transient failures
    pub fn set_healthy(&self, backend_id: &str) {
        self.failing.lock().unwrap().remove(backend_id);
        self.transient.lock().unwrap().remove(backend_id);
    }

    /// The next `times` invocations of `backend_id` fail
    pub fn fail_times(&self, backend_id: &str, times: u32) {
        self.transient
            .lock()
            .unwrap()
            .insert(backend_id.to_string(), times);
    }

    /// Delay every invocation of `backend_id`
    pub fn set_latency(&self, backend_id: &str, latency: Duration) {
        self.latencies
            .lock()
            .unwrap()
            .insert(backend_id.to_string(), latency);
    }

    pub fn request_count(&self, backend_id: &str) -> usize {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.backend_id == backend_id)
            .count()
    }

    pub fn total_request_count(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    pub fn request_history(&self) -> Vec<InvocationRecord> {
        self.history.lock().unwrap().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
    }

    fn should_fail(&self, backend_id: &str) -> bool {
        if self.failing.lock().unwrap().contains(backend_id) {
            return true;
        }
        let mut transient = self.transient.lock().unwrap();
        match transient.get_mut(backend_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(
        &self,
        backend_id: &str,
        instance_id: &str,
        prompt: &str,
        _options: &RequestOptions,
    ) -> Result<Invocation, InvokeError> {
        self.history.lock().unwrap().push(InvocationRecord {
            backend_id: backend_id.to_string(),
            instance_id: instance_id.to_string(),
            prompt: prompt.to_string(),
            timestamp: Instant::now(),
        });

        let latency = self.latencies.lock().unwrap().get(backend_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.should_fail(backend_id) {
            return Err(InvokeError::Unavailable(format!("{backend_id} is down")));
        }

        Ok(Invocation {
            content: format!("[{backend_id}] {prompt}"),
            tokens_used: prompt.split_whitespace().count() as u64,
            response_time_ms: latency.map_or(1, |l| l.as_millis() as u64),
        })
    }
}

// ============================================================================
// Mock Probe
// ============================================================================

/// Health probe that reports every instance healthy unless told otherwise
#[derive(Clone, Default)]
pub struct MockProbe {
    unreachable: Arc<Mutex<HashSet<String>>>,
    calls: Arc<AtomicUsize>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, instance_id: &str) {
        self.unreachable
            .lock()
            .unwrap()
            .insert(instance_id.to_string());
    }

    pub fn set_reachable(&self, instance_id: &str) {
        self.unreachable.lock().unwrap().remove(instance_id);
    }

    /// Shared count of probes made
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn probe(
        &self,
        _backend_id: &str,
        instance_id: &str,
    ) -> Result<InstanceHealth, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().unwrap().contains(instance_id) {
            return Err(ProbeError::Unreachable(format!(
                "{instance_id}: connection refused"
            )));
        }
        Ok(InstanceHealth::healthy(5.0))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Single-instance backends with every capability, in the given order
pub fn catalog(ids: &[&str]) -> Vec<Backend> {
    ids.iter()
        .map(|id| {
            Backend::new(*id, *id)
                .with_capabilities(CapabilitySet::all())
                .with_response_time_ms(1000)
        })
        .collect()
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert that a backend was invoked exactly `times` times
pub fn assert_backend_called(invoker: &MockInvoker, backend_id: &str, times: usize) {
    let actual = invoker.request_count(backend_id);
    assert_eq!(
        actual, times,
        "Expected '{}' to be called {} times, but was called {} times",
        backend_id, times, actual
    );
}

/// Assert that no backend was invoked
pub fn assert_no_backends_called(invoker: &MockInvoker) {
    let total = invoker.total_request_count();
    assert_eq!(
        total, 0,
        "Expected no backends to be called, but {} calls were made",
        total
    );
}

/// Assert that backends were invoked in a specific order
pub fn assert_call_order(invoker: &MockInvoker, expected_order: &[&str]) {
    let history = invoker.request_history();
    let actual_order: Vec<&str> = history.iter().map(|r| r.backend_id.as_str()).collect();

    assert_eq!(
        actual_order.len(),
        expected_order.len(),
        "Expected {} calls, got {}. Actual order: {:?}",
        expected_order.len(),
        actual_order.len(),
        actual_order
    );

    for (i, (actual, expected)) in actual_order.iter().zip(expected_order.iter()).enumerate() {
        assert_eq!(
            actual, expected,
            "Call {} was to '{}', expected '{}'",
            i, actual, expected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_invoker_tracks_and_fails() {
        let invoker = MockInvoker::new();
        let options = RequestOptions::default();

        let ok = invoker.invoke("a", "a", "two words", &options).await.unwrap();
        assert_eq!(ok.content, "[a] two words");
        assert_eq!(ok.tokens_used, 2);

        invoker.set_failing("b");
        assert!(invoker.invoke("b", "b", "x", &options).await.is_err());
        invoker.set_healthy("b");
        assert!(invoker.invoke("b", "b", "x", &options).await.is_ok());

        invoker.fail_times("c", 1);
        assert!(invoker.invoke("c", "c", "x", &options).await.is_err());
        assert!(invoker.invoke("c", "c", "x", &options).await.is_ok());

        assert_backend_called(&invoker, "c", 2);
        assert_call_order(&invoker, &["a", "b", "b", "c", "c"]);
        assert_eq!(invoker.request_history()[0].prompt, "two words");

        invoker.clear_history();
        assert_no_backends_called(&invoker);
    }

    #[tokio::test]
    async fn test_mock_probe() {
        let probe = MockProbe::new();
        probe.set_unreachable("east");
        assert!(probe.probe("pool", "east").await.is_err());
        probe.set_reachable("east");
        assert!(probe.probe("pool", "east").await.is_ok());
        assert_eq!(probe.call_counter().load(Ordering::SeqCst), 2);
    }
}
