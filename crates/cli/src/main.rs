//! Reverse exporter service binary.
//!
//! Loads and validates the configuration, mounts one aggregated scrape
//! endpoint per configured path, and serves them on every configured
//! listener until interrupted. Configuration errors and fatal listener
//! failures exit with status 1.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LISTEN: &str = "http://0.0.0.0:9998";

#[derive(Parser)]
#[command(
    name = "reverse-exporter",
    version,
    about = "Logically-decoding reverse proxy for Prometheus exporters"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        env = "REVERSE_EXPORTER_CONFIG",
        default_value = "reverse_exporter.yml"
    )]
    config: PathBuf,

    /// Log filter directive, e.g. "info" or "reverse_exporter_proxy=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = reverse_exporter_config::load_from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if config.reverse_exporters.is_empty() {
        bail!("configuration declares no reverse_exporters");
    }

    let router = reverse_exporter_proxy::build_router(&config)?;

    let web = config.web.clone().unwrap_or_default();
    if let Some(timeout) = web.read_header_timeout {
        debug!(?timeout, "read_header_timeout accepted");
    }
    let listen_urls = if web.listen.is_empty() {
        vec![DEFAULT_LISTEN.to_string()]
    } else {
        web.listen.clone()
    };

    let mut servers = JoinSet::new();
    for listen in &listen_urls {
        let addr = listener_addr(listen)?;
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(listen = %addr, "reverse exporter listening");
        let app = router.clone();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        });
    }

    while let Some(served) = servers.join_next().await {
        served.context("listener task failed")??;
    }
    info!("reverse exporter stopped");
    Ok(())
}

/// Resolves a `http://host:port` listen URL to a bind address.
fn listener_addr(listen: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(listen).with_context(|| format!("invalid listen URL {listen:?}"))?;
    if url.scheme() != "http" {
        bail!("unsupported listen scheme {:?} in {listen:?}", url.scheme());
    }
    let host = url
        .host_str()
        .with_context(|| format!("listen URL {listen:?} needs a host"))?;
    let port = url.port().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install shutdown signal handler");
        return;
    }
    info!("shutdown signal received");
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_addr_resolves_host_and_port() {
        assert_eq!(listener_addr("http://0.0.0.0:9998").unwrap(), "0.0.0.0:9998");
        assert_eq!(listener_addr("http://localhost").unwrap(), "localhost:80");
        assert!(listener_addr("tcp://0.0.0.0:1").is_err());
        assert!(listener_addr("not a url").is_err());
    }
}
