//! crucible CLI - streaming test-execution orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use crucible::config::{self, BackendConfig, Config};
use crucible::dispatch::Dispatcher;
use crucible::external::{
    KeyFormatDetector, StructuralValidator, TemplateDocGenerator, TemplateImprovementGenerator,
    default_synthesizers,
};
use crucible::generate::GenerationCoordinator;
use crucible::link::{RunnerClient, TestExecutor};
use crucible::session::SessionState;
use crucible::{runner, sandbox, session};

#[derive(Parser)]
#[command(name = "crucible")]
#[command(about = "Streaming test-execution orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "crucible.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client-facing orchestrator
    Serve,

    /// Run the sandbox-facing runner service
    Runner,

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => serve(&cli.config).await,
        Commands::Runner => run_runner(&cli.config).await,
        Commands::Validate => validate_config(&cli.config),
    }
}

/// Loads the configuration file, falling back to defaults when it does
/// not exist.
fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    } else {
        warn!(
            "Config file {} not found, using defaults",
            path.display()
        );
        Ok(Config::default())
    }
}

/// Runs the orchestrator: client sessions on one side, the runner link on
/// the other.
async fn serve(config_path: &Path) -> Result<()> {
    let config = load_or_default(config_path)?;

    let executor: Arc<dyn TestExecutor> = Arc::new(RunnerClient::new(config.link.clone()));
    let coordinator = GenerationCoordinator::new(default_synthesizers(), Arc::clone(&executor));

    let state = Arc::new(SessionState::new(
        config.orchestrator.clone(),
        executor,
        Arc::new(KeyFormatDetector),
        Arc::new(StructuralValidator::new()),
        coordinator,
        Arc::new(TemplateDocGenerator),
        Arc::new(TemplateImprovementGenerator),
    ));

    let app = session::router(Arc::clone(&state));
    let listener = TcpListener::bind(&config.orchestrator.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.orchestrator.bind))?;

    info!("Orchestrator listening on {}", config.orchestrator.bind);
    info!("Runner link endpoint: {}", config.link.runner_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Orchestrator server error")?;

    // Drain: cancel whatever the surviving sessions still have in flight.
    state.shutdown_sessions();
    info!("Orchestrator stopped");
    Ok(())
}

/// Runs the runner service against the configured sandbox backend.
async fn run_runner(config_path: &Path) -> Result<()> {
    let config = load_or_default(config_path)?;

    let backend = sandbox::build_backend(&config.runner.backend)
        .await
        .context("Failed to initialize sandbox backend")?;
    info!("Sandbox backend: {}", backend.name());

    let dispatcher = Arc::new(Dispatcher::new(
        backend,
        config.runner.max_parallel_per_dispatch,
    ));

    let app = runner::router(dispatcher);
    let listener = TcpListener::bind(&config.runner.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.runner.bind))?;

    info!("Test runner listening on {}", config.runner.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Runner server error")?;

    info!("Test runner stopped");
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    println!("Configuration OK: {}", config_path.display());
    println!("  orchestrator bind: {}", config.orchestrator.bind);
    println!("  runner bind:       {}", config.runner.bind);
    println!("  runner link:       {}", config.link.runner_url);
    let backend = match &config.runner.backend {
        BackendConfig::Docker(cfg) => format!("docker (image {})", cfg.limits.image),
        BackendConfig::Kubernetes(cfg) => format!(
            "kubernetes (image {}, namespace {})",
            cfg.limits.image, cfg.namespace
        ),
    };
    println!("  sandbox backend:   {backend}");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
    }
}
