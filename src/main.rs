//! pyrunner
//!
//! Serves stateful Python execution sessions over WebSocket.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pyrunner::{config::Config, server};

#[derive(Parser, Debug)]
#[command(name = "pyrunner")]
#[command(about = "Remote stateful Python execution over WebSocket")]
struct Args {
    /// JSON config file (environment variables still override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overriding config and PORT
    #[arg(long)]
    port: Option<u16>,

    /// Listen address, overriding config and HOST
    #[arg(long)]
    host: Option<IpAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }

    info!(
        port = config.port,
        timeout_seconds = config.execution_timeout_seconds,
        cors_origins = ?config.cors_origins,
        allowed_hosts = ?config.allowed_hosts,
        version = %config.version,
        "Loaded configuration"
    );

    server::serve(config).await
}
