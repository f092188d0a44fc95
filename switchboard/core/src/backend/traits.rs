//! Backend Invocation Traits
//!
//! The routing core never talks to a provider itself. Whoever embeds it
//! supplies an [`Invoker`] that performs the actual call, and optionally a
//! [`HealthProbe`] that checks whether an instance is reachable.
//!
//! # Design Philosophy
//!
//! Both traits are deliberately narrow:
//! - One method each, keyed by backend and instance id
//! - Errors are plain data so the dispatcher can turn them into metrics
//! - No knowledge of HTTP, auth or wire formats
//!
//! Implementations handle provider-specific details (API formats, auth, etc.)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::instances::InstanceHealth;

/// Per-request knobs passed through to the invoker
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Maximum tokens in the response (None = invoker default)
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0-1.0)
    pub temperature: Option<f32>,
    /// Budget for a single invocation attempt
    #[serde(default, with = "millis_opt")]
    pub timeout: Option<Duration>,
    /// Extra attempts against the same backend before falling back
    pub retries: Option<u32>,
    /// Budget for the whole request, fallbacks included
    #[serde(default, with = "millis_opt")]
    pub deadline: Option<Duration>,
}

impl RequestOptions {
    /// Create options that defer everything to the dispatcher's settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set retries per backend
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the overall deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// What a successful invocation produced
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// The response text
    pub content: String,
    /// Tokens consumed
    pub tokens_used: u64,
    /// Generation time as reported by the provider
    pub response_time_ms: u64,
}

/// Why an invocation failed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("invocation failed: {0}")]
    Failed(String),
}

/// Why a health probe failed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    #[error("probe failed: {0}")]
    Failed(String),
}

/// Performs the actual call to a backend instance
///
/// Implement this trait to connect the dispatcher to real providers.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "invoker"
    }

    /// Send `prompt` to one instance of a backend
    ///
    /// The dispatcher enforces timeouts itself; implementations do not
    /// need to honor `options.timeout`.
    async fn invoke(
        &self,
        backend_id: &str,
        instance_id: &str,
        prompt: &str,
        options: &RequestOptions,
    ) -> Result<Invocation, InvokeError>;
}

/// Checks whether a backend instance is reachable
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one instance and report its health
    async fn probe(&self, backend_id: &str, instance_id: &str)
        -> Result<InstanceHealth, ProbeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_options_builder() {
        let options = RequestOptions::new()
            .with_max_tokens(100)
            .with_temperature(1.5)
            .with_timeout(Duration::from_millis(250))
            .with_retries(2)
            .with_deadline(Duration::from_secs(5));

        assert_eq!(options.max_tokens, Some(100));
        assert_eq!(options.temperature, Some(1.0));
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.retries, Some(2));
        assert_eq!(options.deadline, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_request_options_durations_as_millis() {
        let options = RequestOptions::new().with_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["timeout"], 1500);
        assert!(json["deadline"].is_null());

        let back: RequestOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            InvokeError::Timeout { timeout_ms: 30 }.to_string(),
            "invocation timed out after 30ms"
        );
        assert_eq!(
            ProbeError::Unreachable("refused".into()).to_string(),
            "instance unreachable: refused"
        );
    }
}
