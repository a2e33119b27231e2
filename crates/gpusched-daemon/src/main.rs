//! gpusched daemon
//!
//! Main daemon process: selects a device provider, runs the placement loop
//! and serves the REST API until interrupted.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use gpusched_api::create_router;
use gpusched_core::{shutdown, DaemonConfig, LoggingConfig};
use gpusched_provider::{registry, GpuProvider};
use gpusched_scheduler::{HttpPredictor, Scheduler};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// gpusched daemon - GPU job scheduler
#[derive(Parser, Debug)]
#[command(name = "gpuschedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Device provider to use
    #[arg(long)]
    provider: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<String>,

    /// Print the registered providers and exit
    #[arg(long)]
    list_providers: bool,
}

impl Args {
    /// Load the configuration file, then apply command-line overrides
    fn load_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(provider) = &self.provider {
            config.provider.name = provider.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }

        Ok(config)
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level '{}'", config.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "text" => builder.try_init(),
        other => return Err(anyhow!("Unknown log format '{}'", other)),
    };
    installed.map_err(|e| anyhow!("Failed to set subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_providers {
        let mut names = registry::list_providers();
        names.sort();
        for name in names {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = args.load_config()?;
    init_logging(&config.logging)?;

    info!("Starting gpusched daemon v{}", env!("CARGO_PKG_VERSION"));

    let (trigger, shutdown) = shutdown::channel();

    // A provider that fails to initialize aborts startup.
    let scheduler = Scheduler::from_registry(
        registry::global(),
        &config.provider,
        config.scheduler.clone(),
        shutdown.clone(),
    )
    .await
    .with_context(|| format!("Failed to start provider '{}'", config.provider.name))?;

    let scheduler = match HttpPredictor::from_config(&config.predictor)? {
        Some(predictor) => {
            info!(url = predictor.url(), "Predictor enabled");
            scheduler.with_predictor(Arc::new(predictor), config.predictor.min_confidence)
        }
        None => scheduler,
    };
    let scheduler = Arc::new(scheduler);

    let placement = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let router = create_router(Arc::clone(&scheduler));

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("Invalid API address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("API server listening on {}", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await;

    trigger.trigger();
    if let Err(e) = placement.await {
        warn!(error = %e, "Placement loop ended abnormally");
    }
    if let Err(e) = scheduler.provider().close().await {
        warn!(error = %e, "Provider close failed");
    }

    info!("gpusched daemon stopped");
    served.context("Server error")
}
