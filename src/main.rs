//! Betty Router - Main Entry Point

use async_trait::async_trait;
use betty_router::config::RouterConfig;
use betty_router::health::HealthMonitor;
use betty_router::learning::{FeatureScale, LearningEngine};
use betty_router::observability::{init_default_logging, HealthServer, MetricsCollector};
use betty_router::orchestrator::{DispatchError, DispatchReport, Dispatcher};
use betty_router::registry::{Agent, AgentRegistry};
use betty_router::routing::TaskContext;
use betty_router::service::RoutingService;
use betty_router::storage::{open_store, read_outcome_log};
use betty_router::{Clock, ManualClock, SystemClock};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Context-aware agent routing service
#[derive(Parser)]
#[command(name = "betty-router")]
#[command(about = "Context-aware agent routing: selection, circuit breaking, health and learning")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BETTY_ROUTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the routing service and its probe server
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Rebuild agent health and learned weights from an outcome log
    Replay {
        /// JSON-lines file with one execution outcome per line
        outcomes: PathBuf,
    },
}

/// Placeholder for deployments where the embedding application dispatches
/// tasks itself and only uses the router for decisions and bookkeeping
#[derive(Debug)]
struct DecisionOnlyDispatcher;

#[async_trait]
impl Dispatcher for DecisionOnlyDispatcher {
    async fn dispatch(
        &self,
        agent: &Agent,
        _task: &TaskContext,
    ) -> Result<DispatchReport, DispatchError> {
        Err(DispatchError::Rejected(format!(
            "no dispatch transport configured for agent '{}'",
            agent.id
        )))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize observability system
    init_default_logging();

    info!("Starting betty-router v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Replay { outcomes } => replay_outcomes(config, &outcomes).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> Result<RouterConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(RouterConfig::load_from_file(path)?);
    }

    for path_str in ["betty-router.toml", "config/betty-router.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(RouterConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using defaults");
    let config = RouterConfig::default();
    config.validate()?;
    Ok(config)
}

async fn run_service(config: RouterConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&config.storage).await?;
    let health_port = config.service.health_port;
    let service = Arc::new(
        RoutingService::new(
            config,
            store,
            Arc::new(SystemClock),
            Arc::new(DecisionOnlyDispatcher),
        )
        .await?,
    );
    service.start_background_tasks();

    let health_server = Arc::new(HealthServer::new(service.clone(), health_port));
    let server_handle = tokio::spawn(health_server.clone().start());
    health_server.set_ready(true);

    // Graceful shutdown on SIGINT/SIGTERM
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(
        agents = service.registry().agent_count(),
        port = health_port,
        "Routing service running"
    );

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    health_server.set_ready(false);
    service.shutdown().await;
    server_handle.abort();
    Ok(())
}

fn handle_config_command(config: &RouterConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}

async fn replay_outcomes(config: RouterConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let outcomes = read_outcome_log(path).await?;
    info!(outcomes = outcomes.len(), path = %path.display(), "Replaying outcome log");

    // Pin the clock to the newest outcome so the health window covers the log
    let end = outcomes
        .iter()
        .map(|o| o.recorded_at)
        .max()
        .unwrap_or_else(chrono::Utc::now);
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(end));

    let registry = AgentRegistry::with_agents(config.agents.iter().cloned());
    for outcome in &outcomes {
        if !registry.contains(&outcome.agent_id) {
            registry.register_agent(Agent::new(&outcome.agent_id, &outcome.agent_id));
        }
    }

    let health = HealthMonitor::new(config.health.clone(), registry, clock.clone());
    let learning = LearningEngine::new(
        config.learning.clone(),
        config.selection.baseline_weights,
        FeatureScale {
            latency_target_ms: config.health.latency_target_ms,
            cost_reference_cents: config.selection.cost_reference_cents,
        },
        clock,
        Arc::new(MetricsCollector::new()),
    );

    let snapshots = health.replay(&outcomes);
    let weights = learning.replay(&outcomes);

    let report = json!({
        "outcomes": outcomes.len(),
        "health": snapshots,
        "weights": weights.as_ref(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
