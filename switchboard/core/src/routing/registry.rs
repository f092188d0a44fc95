//! Backend Registry
//!
//! The static catalog of known backends. Registration order is catalog
//! order: it breaks selector ties and fixes the fallback sequence, so a
//! re-registration overwrites the entry in place instead of moving it.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::{Capability, CapabilitySet};
use super::health::HealthTracker;

// ============================================================================
// Provider
// ============================================================================

/// Where a provider runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    Cloud,
    Local,
    Hybrid,
}

/// Request quotas advertised by a provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub requests_per_day: u32,
}

/// The organisation or runtime serving one or more backends
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Provider identifier, referenced by backends
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Deployment kind
    #[serde(default, rename = "type")]
    pub provider_type: ProviderType,
    /// Base endpoint, opaque to the core
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Advertised quotas
    #[serde(default)]
    pub rate_limits: RateLimits,
}

impl Provider {
    /// Create a provider with an id and display name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

/// What a backend's model produces
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    TextGeneration,
    CodeGeneration,
    Embedding,
    Vision,
    Multimodal,
}

/// Whether a backend is listed among the primaries or the fallbacks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Primary,
    Fallback,
}

/// One independently reachable deployment of a backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: None,
        }
    }
}

/// A compute provider variant with a fixed capability, cost and latency profile
///
/// Immutable once registered; share it as `Arc<Backend>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    /// Unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Serving provider
    pub provider: Provider,
    /// Output modality
    pub model_type: ModelType,
    /// Catalog tier
    pub tier: Tier,
    /// Supported capabilities
    pub capabilities: CapabilitySet,
    /// Maximum context size in tokens
    pub context_window: u32,
    /// Price per token
    pub cost_per_token: f64,
    /// Nominal response time in milliseconds
    pub response_time_ms: u64,
    /// Redundant deployments (empty = the backend is its own single endpoint)
    pub instances: Vec<Instance>,
}

impl Backend {
    /// Create a backend with permissive defaults
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: Provider::default(),
            model_type: ModelType::default(),
            tier: Tier::default(),
            capabilities: CapabilitySet::empty(),
            context_window: 8192,
            cost_per_token: 0.0,
            response_time_ms: 1000,
            instances: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    #[must_use]
    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    #[must_use]
    pub fn with_response_time_ms(mut self, ms: u64) -> Self {
        self.response_time_ms = ms;
        self
    }

    #[must_use]
    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instances.push(instance);
        self
    }

    /// Cost of a nominal 1000-token request
    #[must_use]
    pub fn cost_per_request(&self) -> f64 {
        self.cost_per_token * 1000.0
    }

    /// Instance ids to probe or balance over; the backend id stands in when there are none
    #[must_use]
    pub fn endpoint_ids(&self) -> Vec<String> {
        if self.instances.is_empty() {
            vec![self.id.clone()]
        } else {
            self.instances.iter().map(|i| i.id.clone()).collect()
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry lookup failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("backend not found: {id}")]
    NotFound { id: String },
}

/// The backend catalog
///
/// Read-mostly after startup; lookups take a shared lock.
#[derive(Debug, Default)]
pub struct Registry {
    catalog: RwLock<Vec<Arc<Backend>>>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from backends in declaration order
    pub fn from_catalog(backends: impl IntoIterator<Item = Backend>) -> Self {
        let registry = Self::new();
        for backend in backends {
            registry.register(backend);
        }
        registry
    }

    /// Register a backend, overwriting any entry with the same id
    ///
    /// The catalog stays partitioned by tier: primaries first, then
    /// fallbacks, each in registration order. A replacement keeps its slot
    /// unless its tier changed, in which case it moves to the end of its
    /// new tier.
    pub fn register(&self, backend: Backend) -> Arc<Backend> {
        let backend = Arc::new(backend);
        let mut catalog = self.catalog.write();
        if let Some(idx) = catalog.iter().position(|b| b.id == backend.id) {
            tracing::debug!(backend = %backend.id, "Replacing registered backend");
            if catalog[idx].tier == backend.tier {
                catalog[idx] = backend.clone();
                return backend;
            }
            catalog.remove(idx);
        } else {
            tracing::debug!(backend = %backend.id, tier = ?backend.tier, "Registered backend");
        }
        let at = catalog
            .iter()
            .position(|b| b.tier > backend.tier)
            .unwrap_or(catalog.len());
        catalog.insert(at, backend.clone());
        backend
    }

    /// Look up a backend by id
    pub fn get(&self, id: &str) -> Result<Arc<Backend>, RegistryError> {
        self.catalog
            .read()
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    /// Whether a backend is registered
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.catalog.read().iter().any(|b| b.id == id)
    }

    /// Every backend, in catalog order
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.catalog.read().clone()
    }

    /// Backends whose current status is available, in catalog order
    #[must_use]
    pub fn available(&self, tracker: &HealthTracker) -> Vec<Arc<Backend>> {
        self.catalog
            .read()
            .iter()
            .filter(|b| tracker.is_available(&b.id))
            .cloned()
            .collect()
    }

    /// Number of registered backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.catalog.read().len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.catalog.read().is_empty()
    }
}
