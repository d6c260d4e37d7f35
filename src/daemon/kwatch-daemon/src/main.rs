//! kwatch - reports file system changes as they happen
//!
//! Watches paths through inotify, dnotify or fanotify and prints one line per
//! event until interrupted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kwatch_core::BackendKind;
use kwatch_daemon::config::{LogFormat, LoggingConfig, MetricsConfig};
use kwatch_daemon::{merge_paths, require_paths, ConfigManager, Daemon, OutputFormat};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration file read when none is given
const DEFAULT_CONFIG: &str = "kwatch.toml";

/// kwatch - Linux file system change monitor
#[derive(Parser)]
#[command(name = "kwatch")]
#[command(about = "Reports file system changes using the Linux notification APIs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch paths and report events until interrupted
    Start(StartArgs),
    /// Validate configuration
    Validate(ValidateArgs),
    /// Generate default configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Paths to watch, replacing the configured ones
    paths: Vec<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Notification backend (inotify, dnotify, fanotify)
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Event output format
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file to validate
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file for generated config
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    output: PathBuf,

    /// Overwrite existing file
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start_daemon(args),
        Commands::Validate(args) => validate_config(args),
        Commands::Config(args) => generate_config(args),
    }
}

/// Start watching
fn start_daemon(args: StartArgs) -> Result<()> {
    let config_manager = load_config(args.config.as_deref())?;
    let mut config = config_manager.get_config();

    // Apply CLI overrides
    if let Some(backend) = args.backend {
        config.watcher.backend = backend;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    ConfigManager::validate(&config)?;
    init_tracing(&config.logging)?;

    if config_manager.config_path().is_none() {
        warn!("Configuration file not found, using defaults");
    }

    config.watcher.paths = merge_paths(args.paths, &config.watcher.paths);
    require_paths(&config.watcher.paths)?;

    info!("Starting kwatch v{}", env!("CARGO_PKG_VERSION"));

    // Signals are blocked here, before the runtime starts any thread
    let metrics_config = config.metrics.clone();
    let daemon = Daemon::new(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        if metrics_config.enabled {
            init_metrics(&metrics_config)?;
        }
        daemon.run().await?;
        Ok::<(), anyhow::Error>(())
    })
}

/// An explicit file must load; the default file is optional
fn load_config(path: Option<&Path>) -> Result<ConfigManager> {
    let mut config_manager = ConfigManager::new();

    match path {
        Some(path) => config_manager
            .load_from_file(path)
            .with_context(|| "Failed to load configuration")?,
        None if Path::new(DEFAULT_CONFIG).exists() => config_manager
            .load_from_file(DEFAULT_CONFIG)
            .with_context(|| "Failed to load configuration")?,
        None => config_manager.load_from_env()?,
    }

    Ok(config_manager)
}

/// Validate configuration file
fn validate_config(args: ValidateArgs) -> Result<()> {
    let mut config_manager = ConfigManager::new();
    config_manager.load_from_file(&args.config)?;

    let config = config_manager.get_config();
    ConfigManager::validate(&config)?;

    println!("✓ Configuration is valid");
    Ok(())
}

/// Generate default configuration file
fn generate_config(args: ConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "Configuration file already exists: {}",
            args.output.display()
        );
    }

    let config_manager = ConfigManager::new();
    config_manager.save_to_file(&args.output)?;

    println!("Generated configuration file: {}", args.output.display());
    Ok(())
}

/// Initialize tracing/logging on stderr, keeping stdout for events
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }

    Ok(())
}

/// Initialize Prometheus metrics
fn init_metrics(config: &MetricsConfig) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.port))
        .install()
        .context("Failed to start metrics exporter")?;

    info!("Metrics endpoint started on port {}", config.port);
    Ok(())
}
