//! Collaborators the CLI plugs into the dispatcher
//!
//! - [`TcpProbe`]: health probe that opens a TCP connection to each instance endpoint
//! - [`EchoInvoker`]: invoker for dry runs that echoes the prompt and fails on request

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use switchboard_core::{
    Backend, HealthProbe, InstanceHealth, Invocation, InvokeError, Invoker, ProbeError,
    RequestOptions,
};

/// `host:port` of an endpoint such as `https://api.example.com/v1` or `localhost:11434`
pub fn socket_address(endpoint: &str) -> Option<String> {
    let (default_port, rest) = match endpoint.split_once("://") {
        Some(("https", rest)) => (443, rest),
        Some(("http", rest)) => (80, rest),
        Some((_, rest)) => (80, rest),
        None => (80, endpoint),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() {
        return None;
    }
    if authority.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:{default_port}"))
    }
}

/// Probes instances by connecting to their configured endpoints
pub struct TcpProbe {
    endpoints: HashMap<(String, String), String>,
    timeout: Duration,
}

impl TcpProbe {
    /// Collect endpoints from a catalog
    ///
    /// An instance without its own endpoint inherits the provider's.
    pub fn from_catalog(catalog: &[Backend], timeout: Duration) -> Self {
        let mut endpoints = HashMap::new();
        for backend in catalog {
            let fallback = backend.provider.endpoint.clone();
            if backend.instances.is_empty() {
                if let Some(endpoint) = fallback {
                    endpoints.insert((backend.id.clone(), backend.id.clone()), endpoint);
                }
                continue;
            }
            for instance in &backend.instances {
                if let Some(endpoint) = instance.endpoint.clone().or_else(|| fallback.clone()) {
                    endpoints.insert((backend.id.clone(), instance.id.clone()), endpoint);
                }
            }
        }
        Self { endpoints, timeout }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(
        &self,
        backend_id: &str,
        instance_id: &str,
    ) -> Result<InstanceHealth, ProbeError> {
        let endpoint = self
            .endpoints
            .get(&(backend_id.to_string(), instance_id.to_string()))
            .ok_or_else(|| ProbeError::Failed("no endpoint configured".to_string()))?;
        let address = socket_address(endpoint)
            .ok_or_else(|| ProbeError::Failed(format!("cannot parse endpoint '{endpoint}'")))?;

        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => Ok(InstanceHealth::healthy(
                started.elapsed().as_secs_f64() * 1000.0,
            )),
            Ok(Err(e)) => Err(ProbeError::Unreachable(format!("{address}: {e}"))),
            Err(_) => Err(ProbeError::Unreachable(format!(
                "{address}: no answer within {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Answers every request with the prompt, except for backends told to fail
#[derive(Default)]
pub struct EchoInvoker {
    failing: HashSet<String>,
}

impl EchoInvoker {
    pub fn failing(backends: impl IntoIterator<Item = String>) -> Self {
        Self {
            failing: backends.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Invoker for EchoInvoker {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(
        &self,
        backend_id: &str,
        instance_id: &str,
        prompt: &str,
        _options: &RequestOptions,
    ) -> Result<Invocation, InvokeError> {
        if self.failing.contains(backend_id) {
            return Err(InvokeError::Unavailable(format!(
                "{backend_id} is marked failing for this run"
            )));
        }
        Ok(Invocation {
            content: format!("[{backend_id}/{instance_id}] {prompt}"),
            tokens_used: prompt.split_whitespace().count() as u64,
            response_time_ms: 0,
        })
    }
}
