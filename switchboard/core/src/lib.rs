//! Switchboard Core - Backend Selection and Dispatch
//!
//! This crate picks a compute backend for each request, spreads load across
//! that backend's instances, and keeps trying other backends until one
//! answers or every suitable backend has failed. It knows nothing about how
//! a backend is actually called: the embedding application supplies an
//! [`Invoker`] (and optionally a [`HealthProbe`]), and the core does the rest.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Embedding Application                        │
//! │      ┌───────────────┐                     ┌──────────────────┐   │
//! │      │    Invoker    │                     │   HealthProbe    │   │
//! │      └───────▲───────┘                     └────────▲─────────┘   │
//! └──────────────┼──────────────────────────────────────┼─────────────┘
//!                │                                      │
//! ┌──────────────┼──────────────────────────────────────┼─────────────┐
//! │              │         SWITCHBOARD CORE             │             │
//! │  ┌───────────┴──────────────────────────────────────┴──────────┐  │
//! │  │                        Dispatcher                            │  │
//! │  │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────┐  │  │
//! │  │  │ Registry │  │ Selector │  │ Balancer │  │HealthTracker │  │  │
//! │  │  └──────────┘  └──────────┘  └──────────┘  └──────────────┘  │  │
//! │  └──────────────────────────────┬───────────────────────────────┘  │
//! │                                 │                                  │
//! │                       SwitchboardEvent (out)                       │
//! └─────────────────────────────────┼──────────────────────────────────┘
//!                                   ▼
//!                        UI / telemetry subscribers
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: Entry point; runs requests with retry, fallback and dedup
//! - [`SelectionRequirement`]: What a request needs from a backend
//! - [`Registry`]: The backend catalog
//! - [`HealthTracker`]: Per-backend metrics, status and alerts
//! - [`Balancer`]: Instance selection within a backend
//! - [`SwitchboardEvent`]: Everything the core reports to observers
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{
//!     load_config, Dispatcher, RequestOptions, SelectionRequirement, TaskCategory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let dispatcher = Dispatcher::from_config(&config, Arc::new(MyInvoker::new()), None);
//!
//!     let mut events = dispatcher.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{}", serde_json::to_string(&event).unwrap_or_default());
//!         }
//!     });
//!
//!     let requirement = SelectionRequirement::new(TaskCategory::CodeGeneration);
//!     let response = dispatcher
//!         .execute("write a tokenizer", &requirement, &RequestOptions::default())
//!         .await?;
//!     println!("{} answered: {}", response.backend_id, response.content);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Collaborator traits for invoking and probing backends
//! - [`config`]: TOML, environment and CLI configuration
//! - [`events`]: Event types and the broadcast bus
//! - [`routing`]: Registry, health tracking, selection, balancing and dispatch
//!
//! # No Global State
//!
//! Every component is constructed explicitly and handed its collaborators.
//! Two dispatchers in one process share nothing unless you share it.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod events;
pub mod routing;

// Collaborator exports
pub use backend::{HealthProbe, Invocation, InvokeError, Invoker, ProbeError, RequestOptions};

// Event exports
pub use events::{EventBus, SwitchboardEvent};

// Routing exports
pub use routing::{
    Alert, AlertKind, AlertSeverity, AlertThresholds, Backend, BackendMetrics, BackendStatus,
    Balancer, BalancingConfig, BalancingStrategy, Capability, CapabilitySet, Completion,
    DispatchError, DispatchResponse, DispatchSettings, Dispatcher, DispatcherParts,
    ExternalStatus, HealthCheckResult, HealthTracker, Instance, InstanceHealth, InstanceStatus,
    OrchestrationStatus, Provider, Registry, RetryConfig, SelectionRequirement, SelectionResult,
    SelectionStrategy, Selector, TaskCategory, Tier,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, SwitchboardConfig, SwitchboardToml,
};
