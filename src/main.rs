use anyhow::{Context, Result};
use clap::Parser;
use share_search::config::Config;
use share_search::share::{Listers, StaticShareRegistry};
use share_search::telemetry::{init_telemetry, shutdown_telemetry};
use share_search::{web, IndexRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

/// Share Search Server - file name search over local and SMB shares
#[derive(Parser, Debug)]
#[command(name = "share_search")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server listen address (overrides config file)
    #[arg(short, long, value_name = "ADDR")]
    address: Option<String>,

    /// Directory for persisted indexes (overrides config file)
    #[arg(long, value_name = "DIR")]
    index_dir: Option<PathBuf>,

    /// Skip building missing indexes on startup
    #[arg(long)]
    no_auto_index: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Generate a template configuration file and exit
    #[arg(long, value_name = "FILE")]
    init: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --init flag: generate template config and exit
    if let Some(init_path) = args.init.clone() {
        let path = if init_path.as_os_str().is_empty() {
            PathBuf::from("share_search.toml")
        } else {
            init_path
        };

        if path.exists() {
            anyhow::bail!(
                "Config file already exists: {}\nRemove it first or choose a different path.",
                path.display()
            );
        }

        Config::write_template(&path)?;
        println!("✓ Generated config file: {}", path.display());
        println!("\nEdit the file to add your shares, then start the server with:");
        println!("  share_search_server --config {}", path.display());
        return Ok(());
    }

    let (config, source) = load_config(&args)?;

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_telemetry(&config.telemetry.clone().with_env_overrides(), log_level)?;

    match &source {
        Some(path) => info!(path = %path.display(), "Loaded config file"),
        None => info!("No config file found, using defaults"),
    }
    info!(
        server_address = %config.server.address,
        shares_count = config.shares.len(),
        index_dir = %config.index.resolved_index_dir().display(),
        "Configuration loaded"
    );
    if args.verbose {
        info!(exclude_patterns = ?config.index.exclude_patterns, "Exclude patterns");
        info!(incremental = ?config.index.incremental, "Incremental updates");
    }
    if !config.server.auto_index {
        info!("Auto-indexing disabled, indexes are built on first search");
    }

    let shares = Arc::new(StaticShareRegistry::new(config.shares.clone()));
    let listers = Listers::standard(config.index.smb_concurrency);
    let registry = IndexRegistry::new(&config, shares, listers)?;
    registry.init().await?;

    let listener = tokio::net::TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.address))?;
    info!(address = %config.server.address, "Share search API available at http://{}", config.server.address);

    let served = axum::serve(listener, web::create_router(registry.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    registry.shutdown().await;
    shutdown_telemetry();
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
    }
}

/// Resolve the configuration and the file it came from, if any
fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    let (base_config, source) = if let Some(ref config_path) = args.config {
        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found: {}\nUse --init {} to generate a template.",
                config_path.display(),
                config_path.display()
            );
        }
        (Config::from_file(config_path)?, Some(config_path.clone()))
    } else {
        match Config::from_default_locations()? {
            Some((config, path)) => (config, Some(path)),
            None => (Config::default(), None),
        }
    };

    let config =
        base_config.with_overrides(args.address.clone(), args.index_dir.clone(), args.no_auto_index);
    Ok((config, source))
}
