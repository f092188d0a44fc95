//! Switchboard - Backend Catalog Inspector
//!
//! Loads a switchboard configuration and answers questions about it without
//! calling any real backend.
//!
//! # Usage
//!
//! ```bash
//! # Validate the configuration and list the catalog
//! switchboard check
//! switchboard catalog --json
//!
//! # Which backend would serve a request?
//! switchboard select --task code_generation --capability code_generation --context-size 16000
//!
//! # Walk the fallback chain with some backends pretending to fail
//! switchboard simulate --task reasoning --fail gpt-4 --fail claude-3 "prove the lemma"
//!
//! # Probe every instance endpoint over TCP
//! switchboard probe --timeout-ms 2000
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard select --task testing
//! ```

mod collaborators;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use switchboard_core::{
    load_config_from_path, default_config_path, BalancingStrategy, Capability, ConfigOverrides,
    Dispatcher, RequestOptions, SelectionRequirement, SelectionStrategy, SwitchboardConfig,
    TaskCategory,
};

use collaborators::{EchoInvoker, TcpProbe};

/// Switchboard - inspect backend selection and fallback for a catalog
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the selection strategy
    #[arg(long, value_name = "STRATEGY")]
    strategy: Option<SelectionStrategy>,

    /// Override the balancing strategy
    #[arg(long, value_name = "STRATEGY")]
    balancing: Option<BalancingStrategy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and summarize it
    Check,

    /// List the backend catalog
    Catalog {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show which backend would be selected for a requirement
    Select {
        #[command(flatten)]
        requirement: RequirementArgs,
    },

    /// Run a request through the dispatcher with an echoing invoker
    Simulate {
        #[command(flatten)]
        requirement: RequirementArgs,

        /// Backends that fail every invocation during this run
        #[arg(long = "fail", value_name = "BACKEND")]
        failing: Vec<String>,

        /// Prompt to send
        prompt: String,
    },

    /// Probe every instance endpoint and report its health
    Probe {
        /// Per-instance connect timeout
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
    },
}

/// Requirement of a simulated request
#[derive(clap::Args, Debug)]
struct RequirementArgs {
    /// Task category
    #[arg(short, long)]
    task: TaskCategory,

    /// Required capability (repeatable)
    #[arg(long = "capability", value_name = "CAPABILITY")]
    capabilities: Vec<Capability>,

    /// Context size in tokens
    #[arg(long, default_value_t = 0)]
    context_size: u32,

    /// Response time ceiling
    #[arg(long)]
    max_response_time_ms: Option<u64>,

    /// Per-request cost ceiling
    #[arg(long)]
    max_cost: Option<f64>,
}

impl RequirementArgs {
    fn to_requirement(&self) -> SelectionRequirement {
        let mut requirement =
            SelectionRequirement::new(self.task).with_context_size(self.context_size);
        for capability in &self.capabilities {
            requirement = requirement.with_capability(*capability);
        }
        if let Some(ms) = self.max_response_time_ms {
            requirement = requirement.with_max_response_time_ms(ms);
        }
        if let Some(cost) = self.max_cost {
            requirement = requirement.with_max_cost_per_request(cost);
        }
        requirement
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_cli={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Load configuration and apply command-line overrides
fn resolve_config(args: &Args) -> Result<SwitchboardConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.clone()).with_context(|| match path {
        Some(ref p) => format!("Failed to load configuration from {}", p.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    let mut overrides = ConfigOverrides::new();
    if let Some(strategy) = args.strategy {
        overrides = overrides.with_selection_strategy(strategy);
    }
    if let Some(strategy) = args.balancing {
        overrides = overrides.with_balancing_strategy(strategy);
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration after overrides")?;

    info!(
        source = %config.source(),
        backends = config.catalog.len(),
        "Configuration resolved"
    );
    Ok(config)
}

fn print_catalog(config: &SwitchboardConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.catalog)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<9} {:>9} {:>10} {:>8}  {}",
        "BACKEND", "TIER", "CONTEXT", "LATENCY", "INST", "CAPABILITIES"
    );
    for backend in &config.catalog {
        println!(
            "{:<24} {:<9} {:>9} {:>8}ms {:>8}  {}",
            backend.id,
            format!("{:?}", backend.tier).to_lowercase(),
            backend.context_window,
            backend.response_time_ms,
            backend.endpoint_ids().len(),
            backend.capabilities,
        );
    }
    Ok(())
}

fn check(config: &SwitchboardConfig) {
    let file = config
        .config_file_path
        .as_ref()
        .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());
    println!("Configuration OK");
    println!("  file:       {file}");
    println!("  source:     {}", config.source());
    println!("  selection:  {}", config.selection_strategy);
    println!("  balancing:  {}", config.balancing.strategy);
    println!("  providers:  {}", config.providers.len());
    println!("  backends:   {}", config.catalog.len());
    if config.catalog.is_empty() {
        println!("  warning:    the catalog is empty; every request will be rejected");
    }
}

fn select(config: &SwitchboardConfig, requirement: &SelectionRequirement) -> Result<()> {
    let dispatcher = Dispatcher::from_config(config, Arc::new(EchoInvoker::default()), None);
    requirement.validate()?;

    match dispatcher.select(requirement) {
        Some(selection) => {
            let score = selection
                .score
                .map_or_else(|| "only candidate".to_string(), |s| format!("{s:.3}"));
            println!("selected: {} ({score})", selection.backend.id);
            for runner_up in &selection.runner_ups {
                println!("  then:   {} ({:.3})", runner_up.backend.id, runner_up.score);
            }
        }
        None => println!("no suitable backend for {}", requirement.task),
    }
    Ok(())
}

async fn simulate(
    config: &SwitchboardConfig,
    requirement: &SelectionRequirement,
    failing: Vec<String>,
    prompt: &str,
) -> Result<()> {
    let invoker = Arc::new(EchoInvoker::failing(failing));
    let dispatcher = Dispatcher::from_config(config, invoker, None);
    let mut events = dispatcher.subscribe();

    let outcome = dispatcher
        .execute(prompt, requirement, &RequestOptions::default())
        .await;

    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }

    let response = outcome.context("Simulated request failed")?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    debug!(metrics = ?dispatcher.metrics(), "Simulation complete");
    Ok(())
}

async fn probe(config: &SwitchboardConfig, timeout: Duration) -> Result<()> {
    let probe = Arc::new(TcpProbe::from_catalog(&config.catalog, timeout));
    let dispatcher = Dispatcher::from_config(config, Arc::new(EchoInvoker::default()), Some(probe));

    let results = dispatcher.health_check_all().await;
    for result in &results {
        match result.error {
            Some(ref error) => println!(
                "{:<24} {:<24} {:?}  {error}",
                result.backend_id, result.instance_id, result.health.status
            ),
            None => println!(
                "{:<24} {:<24} {:?}  {:.1}ms",
                result.backend_id,
                result.instance_id,
                result.health.status,
                result.health.response_time_ms
            ),
        }
    }

    let stats = dispatcher.balancing_stats();
    println!(
        "{} instances, {} unhealthy",
        stats.total_instances, stats.unhealthy_instances
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = resolve_config(&args)?;

    match args.command {
        Command::Check => check(&config),
        Command::Catalog { json } => print_catalog(&config, json)?,
        Command::Select { ref requirement } => select(&config, &requirement.to_requirement())?,
        Command::Simulate {
            ref requirement,
            ref failing,
            ref prompt,
        } => simulate(&config, &requirement.to_requirement(), failing.clone(), prompt).await?,
        Command::Probe { timeout_ms } => {
            probe(&config, Duration::from_millis(timeout_ms)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "switchboard",
            "--strategy",
            "cost-optimized",
            "select",
            "--task",
            "code_generation",
            "--capability",
            "code_generation",
            "--capability",
            "reasoning",
            "--context-size",
            "4096",
        ])
        .unwrap();

        assert_eq!(args.strategy, Some(SelectionStrategy::CostOptimized));
        let Command::Select { requirement } = args.command else {
            panic!("expected select");
        };
        let requirement = requirement.to_requirement();
        assert_eq!(requirement.task, TaskCategory::CodeGeneration);
        assert_eq!(requirement.context_size, 4096);
        assert_eq!(requirement.capabilities.len(), 2);
    }

    #[test]
    fn test_resolve_config_applies_overrides() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[selection]
strategy = "hybrid"

[[backends]]
id = "local-coder"
capabilities = ["code_generation"]
context_window = 8192
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let args = Args::try_parse_from([
            "switchboard",
            "--config",
            path.as_str(),
            "--strategy",
            "capability_matched",
            "check",
        ])
        .unwrap();

        let config = resolve_config(&args).unwrap();
        assert_eq!(config.selection_strategy, SelectionStrategy::CapabilityMatched);
        assert_eq!(config.catalog.len(), 1);
        assert_eq!(config.catalog[0].id, "local-coder");
    }

    #[test]
    fn test_unknown_task_rejected() {
        assert!(Args::try_parse_from(["switchboard", "select", "--task", "poetry"]).is_err());
    }

    #[test]
    fn test_simulate_args() {
        let args = Args::try_parse_from([
            "switchboard",
            "simulate",
            "--task",
            "reasoning",
            "--fail",
            "a",
            "--fail",
            "b",
            "why",
        ])
        .unwrap();
        let Command::Simulate {
            failing, prompt, ..
        } = args.command
        else {
            panic!("expected simulate");
        };
        assert_eq!(failing, vec!["a", "b"]);
        assert_eq!(prompt, "why");
    }
}
