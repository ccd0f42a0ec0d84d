//! leastlb - A least-loaded HTTP reverse proxy
//!
//! Usage:
//!     leastlb [--config <path>] [--listen <addr>] [BACKEND_URL...]
//!
//! See --help for more options.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use leastlb::LoadBalancer;
use leastlb::config::{Config, read_config, validate_config};
use leastlb::frontend::FrontendListener;
use leastlb::metrics::{MetricsCollector, MetricsServer};
use leastlb::util::{ShutdownSignal, init_logging};

/// Send every request to the backend with the fewest requests in flight.
#[derive(Parser, Debug)]
#[command(name = "leastlb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to accept client connections on
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Upstream base URLs; replace the backends from the configuration file
    #[arg(value_name = "BACKEND_URL")]
    backends: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = build_config(&cli)?;

    init_logging(&config.global.log_level, &config.global.log_format)
        .context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen);
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {}", backend);
        }
        return Ok(());
    }

    info!(
        listen = %config.listen,
        backends = config.backends.len(),
        "leastlb starting"
    );

    for backend in &config.backends {
        info!(backend = %backend, "configured backend");
    }

    run(config)
}

/// Merge the configuration file with command line overrides and validate
/// the result.
fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => read_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };

    // CLI overrides config
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if !cli.backends.is_empty() {
        config.backends = cli.backends.clone();
    }
    if let Some(level) = &cli.log_level {
        config.global.log_level = level.clone();
    }

    validate_config(&config)
        .map_err(|e| anyhow!(e))
        .context("configuration validation failed")?;

    Ok(config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point for the load balancer.
async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();

    let balancer = LoadBalancer::with_config(&config.backends, &config.proxy, metrics.clone())
        .context("failed to create load balancer")?;

    let mut handles = Vec::new();

    if config.global.metrics.enabled {
        let server = MetricsServer::bind(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            metrics.clone(),
        )
        .await
        .with_context(|| {
            format!(
                "failed to bind metrics server on {}",
                config.global.metrics.address
            )
        })?;

        handles.push(tokio::spawn(server.run(shutdown.subscribe())));
    }

    let listener = FrontendListener::bind(config.listen, Arc::new(balancer), metrics)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;

    handles.push(tokio::spawn(listener.run(shutdown.subscribe())));

    info!("leastlb is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    let notified = shutdown.shutdown();
    info!(listeners = notified, "shutdown signalled");

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "listener task failed");
        }
    }

    info!("leastlb shut down complete");
    Ok(())
}
