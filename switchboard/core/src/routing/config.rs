//! Routing Configuration Types
//!
//! Closed vocabularies and tunables shared by the selector, balancer,
//! health tracker and dispatcher: task categories, capability sets,
//! selection and balancing strategies, alert thresholds and retry policy.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Parse Errors
// ============================================================================

/// Error returned when a configuration string names no known variant
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}' (expected one of: {expected})")]
pub struct ParseVariantError {
    /// Which vocabulary was being parsed
    pub kind: &'static str,
    /// The rejected input
    pub value: String,
    /// Accepted spellings
    pub expected: &'static str,
}

/// Normalize `code-generation`, `Code_Generation` and `code generation` alike
fn normalize(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
}

// ============================================================================
// Task Category
// ============================================================================

/// The kind of work a request represents
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    CodeGeneration,
    CodeAnalysis,
    NaturalLanguage,
    VisualProcessing,
    ContextUnderstanding,
    Reasoning,
    Documentation,
    Testing,
    Debugging,
    Refactoring,
}

impl TaskCategory {
    /// Every category, in declaration order
    pub const ALL: [TaskCategory; 10] = [
        Self::CodeGeneration,
        Self::CodeAnalysis,
        Self::NaturalLanguage,
        Self::VisualProcessing,
        Self::ContextUnderstanding,
        Self::Reasoning,
        Self::Documentation,
        Self::Testing,
        Self::Debugging,
        Self::Refactoring,
    ];

    /// Stable wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::CodeAnalysis => "code_analysis",
            Self::NaturalLanguage => "natural_language",
            Self::VisualProcessing => "visual_processing",
            Self::ContextUnderstanding => "context_understanding",
            Self::Reasoning => "reasoning",
            Self::Documentation => "documentation",
            Self::Testing => "testing",
            Self::Debugging => "debugging",
            Self::Refactoring => "refactoring",
        }
    }

    /// Backend ids that get a small scoring bonus for this category
    #[must_use]
    pub fn preferred_backends(&self) -> &'static [&'static str] {
        match self {
            Self::CodeGeneration => &["gpt-4", "claude-3", "gpt-4-turbo", "claude-3-sonnet"],
            Self::CodeAnalysis => &["gpt-4", "claude-3", "gpt-4-turbo", "claude-3-opus"],
            Self::NaturalLanguage => &["gpt-4", "claude-3", "gpt-3.5-turbo", "claude-3-haiku"],
            Self::VisualProcessing => &["gpt-4-vision", "claude-3-vision", "gemini-pro-vision"],
            Self::ContextUnderstanding => &["gpt-4-turbo", "claude-3-opus", "gpt-4"],
            Self::Documentation => &["claude-3", "gpt-4", "claude-3-sonnet"],
            Self::Reasoning | Self::Testing | Self::Debugging | Self::Refactoring => &[],
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize(s);
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| ParseVariantError {
                kind: "task category",
                value: s.to_string(),
                expected: "code_generation, code_analysis, natural_language, visual_processing, \
                           context_understanding, reasoning, documentation, testing, debugging, \
                           refactoring",
            })
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// A single backend capability
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CodeGeneration,
    CodeAnalysis,
    NaturalLanguage,
    VisualProcessing,
    ContextUnderstanding,
    Reasoning,
}

impl Capability {
    /// Every capability, in bit order
    pub const ALL: [Capability; 6] = [
        Self::CodeGeneration,
        Self::CodeAnalysis,
        Self::NaturalLanguage,
        Self::VisualProcessing,
        Self::ContextUnderstanding,
        Self::Reasoning,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Stable wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::CodeAnalysis => "code_analysis",
            Self::NaturalLanguage => "natural_language",
            Self::VisualProcessing => "visual_processing",
            Self::ContextUnderstanding => "context_understanding",
            Self::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize(s);
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| ParseVariantError {
                kind: "capability",
                value: s.to_string(),
                expected: "code_generation, code_analysis, natural_language, visual_processing, \
                           context_understanding, reasoning",
            })
    }
}

/// A set of capabilities, stored as one bit per [`Capability`]
///
/// Serializes as a list of capability names in bit order, so two equal sets
/// always produce identical bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// The empty set
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Every capability
    #[must_use]
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    /// Add a capability (builder style)
    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    /// Add a capability
    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    /// Check membership
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Whether every capability in `other` is also in `self`
    #[must_use]
    pub fn is_superset(&self, other: &CapabilitySet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Number of capabilities in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate members in bit order
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }

    /// Fraction of `required` satisfied by `self` (1.0 when nothing is required)
    #[must_use]
    pub fn match_fraction(&self, required: &CapabilitySet) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let satisfied = required.iter().filter(|c| self.contains(*c)).count();
        satisfied as f64 / required.len() as f64
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(value: Vec<Capability>) -> Self {
        value.into_iter().collect()
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(value: CapabilitySet) -> Self {
        value.iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

// ============================================================================
// Selection Strategy
// ============================================================================

/// Relative weight of each sub-score in the selector's final score
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoringWeights {
    pub accuracy: f64,
    pub response_time: f64,
    pub reliability: f64,
    pub cost: f64,
    pub capability_match: f64,
}

/// How the selector trades off quality, latency and cost
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    PerformanceFirst,
    CostOptimized,
    CapabilityMatched,
    #[default]
    Hybrid,
}

impl SelectionStrategy {
    /// Scoring weights for this strategy
    #[must_use]
    pub fn weights(&self) -> ScoringWeights {
        match self {
            Self::PerformanceFirst => ScoringWeights {
                accuracy: 0.4,
                response_time: 0.3,
                reliability: 0.2,
                cost: 0.1,
                capability_match: 0.0,
            },
            Self::CostOptimized => ScoringWeights {
                accuracy: 0.2,
                response_time: 0.2,
                reliability: 0.1,
                cost: 0.5,
                capability_match: 0.0,
            },
            Self::CapabilityMatched => ScoringWeights {
                accuracy: 0.2,
                response_time: 0.1,
                reliability: 0.1,
                cost: 0.0,
                capability_match: 0.6,
            },
            Self::Hybrid => ScoringWeights {
                accuracy: 0.25,
                response_time: 0.25,
                reliability: 0.25,
                cost: 0.25,
                capability_match: 0.0,
            },
        }
    }

    /// Stable wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerformanceFirst => "performance_first",
            Self::CostOptimized => "cost_optimized",
            Self::CapabilityMatched => "capability_matched",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "performance_first" => Ok(Self::PerformanceFirst),
            "cost_optimized" => Ok(Self::CostOptimized),
            "capability_matched" => Ok(Self::CapabilityMatched),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ParseVariantError {
                kind: "selection strategy",
                value: s.to_string(),
                expected: "performance_first, cost_optimized, capability_matched, hybrid",
            }),
        }
    }
}

// ============================================================================
// Balancing
// ============================================================================

/// How the balancer spreads requests over a backend's instances
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    #[default]
    RoundRobin,
    Weighted,
    PerformanceBased,
}

impl BalancingStrategy {
    /// Stable wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Weighted => "weighted",
            Self::PerformanceBased => "performance_based",
        }
    }
}

impl fmt::Display for BalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalancingStrategy {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "performance_based" => Ok(Self::PerformanceBased),
            _ => Err(ParseVariantError {
                kind: "balancing strategy",
                value: s.to_string(),
                expected: "round_robin, weighted, performance_based",
            }),
        }
    }
}

/// Load balancing configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalancingConfig {
    /// Instance selection strategy
    pub strategy: BalancingStrategy,

    /// Per-instance weights for [`BalancingStrategy::Weighted`] (`instance_id` -> weight)
    pub weights: HashMap<String, u32>,

    /// How often the background monitor probes every instance
    pub health_check_interval: Duration,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::RoundRobin,
            weights: HashMap::new(),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Alert Thresholds
// ============================================================================

/// Thresholds whose breach raises a performance alert
#[derive(Clone, Debug, PartialEq)]
pub struct AlertThresholds {
    /// Average response time ceiling; also the scale of the health score's latency penalty
    pub max_response_time_ms: f64,

    /// Error rate ceiling (0.0 - 1.0)
    pub max_error_rate: f64,

    /// Health score floor (0.0 - 1.0)
    pub min_health_score: f64,

    /// Completions per trailing minute before a rate-limit alert
    pub max_requests_per_minute: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_response_time_ms: 10_000.0,
            max_error_rate: 0.1,
            min_health_score: 0.7,
            max_requests_per_minute: 100,
        }
    }
}

// ============================================================================
// Retry / Dispatch Settings
// ============================================================================

/// Retry policy for re-invoking the same backend before falling back
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Retries per backend (0 = one attempt, then fall back)
    pub max_retries: u32,

    /// Initial backoff delay
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            // Up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            capped * (1.0 + jitter)
        } else {
            capped
        };

        Duration::from_millis(duration_ms as u64)
    }
}

/// Dispatcher-wide settings
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchSettings {
    /// Per-attempt timeout when the request does not carry one
    pub default_timeout: Duration,

    /// Optional bound on the whole fallback chain
    pub request_deadline: Option<Duration>,

    /// Same-backend retry policy
    pub retry: RetryConfig,

    /// Capacity of the outbound event channel
    pub event_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            request_deadline: None,
            retry: RetryConfig::default(),
            event_capacity: 256,
        }
    }
}

/// Response caching parameters, handed through to the external cache layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachingConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_size: usize,
    pub compression_enabled: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(300),
            max_size: 1000,
            compression_enabled: false,
        }
    }
}
