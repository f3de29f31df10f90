//! certrelay - ACME certificate relay
//!
//! Obtains and renews certificates on one host and distributes them to
//! authenticated clients that install them locally.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use certrelay_server::CertificateServer;
use certrelay_sync::ReconciliationEngine;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AppConfig, ExampleFormat};

#[derive(Parser, Debug)]
#[command(name = "certrelay")]
#[command(about = "Obtain, renew and distribute TLS certificates", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server and/or client configured in the config file
    Run {
        /// Config file (JSON or YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long, env = "CERTRELAY_LOG")]
        log_level: Option<String>,
    },

    /// Print an example configuration
    Config {
        #[arg(value_enum)]
        format: ExampleFormat,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_level } => run(config, log_level).await,
        Commands::Config { format } => {
            print!("{}", config::render_example(format)?);
            Ok(())
        }
        Commands::Version => {
            println!(
                "{} (commit {}, built {})",
                env!("GIT_TAG"),
                env!("GIT_HASH"),
                env!("BUILD_TIME")
            );
            Ok(())
        }
    }
}

async fn run(config_flag: Option<PathBuf>, log_level: Option<String>) -> Result<()> {
    let path = config::resolve_path(config_flag);
    let app = config::load(&path)?;

    let level = log_level
        .or_else(|| app.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level)?;
    info!("Loaded configuration from {}", path.display());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, shutting down");
            }
            cancel.cancel();
        });
    }

    run_roles(app, cancel).await
}

/// Run every configured role until all of them finish
async fn run_roles(app: AppConfig, cancel: CancellationToken) -> Result<()> {
    if app.server.is_none() && app.client.is_none() {
        anyhow::bail!("Configuration has neither a server nor a client section");
    }

    let server = match app.server {
        Some(server_config) => {
            let server = CertificateServer::from_config(server_config)
                .context("Failed to create certificate server")?;
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                let result = server.run(cancel.clone()).await;
                if result.is_err() {
                    // Take a daemon client down with the server
                    cancel.cancel();
                }
                result
            }))
        }
        None => None,
    };

    let client = match app.client {
        Some(sync_config) => {
            let engine = ReconciliationEngine::from_config(sync_config)
                .context("Failed to create reconciliation engine")?;
            let cancel = cancel.clone();
            Some(tokio::spawn(async move { engine.run(cancel).await }))
        }
        None => None,
    };

    let mut failed = false;

    if let Some(client) = client {
        match client.await.context("Client task panicked")? {
            Ok(()) => info!("Client finished"),
            Err(e) => {
                error!("Client failed: {}", e);
                failed = true;
            }
        }
    }

    if let Some(server) = server {
        match server.await.context("Server task panicked")? {
            Ok(()) => info!("Server stopped"),
            Err(e) => {
                error!("Server failed: {}", e);
                failed = true;
            }
        }
    }

    if failed {
        anyhow::bail!("certrelay exited with errors");
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
