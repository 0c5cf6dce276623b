//! # Registry Operator
//!
//! Kubernetes operator that installs the in-cluster Docker registry described
//! by `DockerRegistry` resources and keeps its access secrets available in
//! every user namespace.
//!
//! ## Configuration
//!
//! - `--metrics-bind-address` / `METRICS_BIND_ADDRESS` (default `:8080`, `0` disables)
//! - `--health-probe-bind-address` / `HEALTH_PROBE_BIND_ADDRESS` (default `:8081`)
//! - `CHART_PATH`, `SYNC_PERIOD_SECS`, `CLEANUP_TIMEOUT_SECS`, `LOG_LEVEL`,
//!   `LOG_FORMAT`, `DOMAIN_CONFIG_PATH`, `OPERATOR_NAME`
//!
//! The process exits with status 0 after a signal-driven shutdown and with
//! status 1 on any startup or run-loop failure.

use anyhow::{Context, Result};
use clap::Parser;
use registry_operator::cleanup::CleanupError;
use registry_operator::client::KubeConnector;
use registry_operator::config::cli::Args;
use registry_operator::config::{OperatorConfig, Settings};
use registry_operator::observability::logging;
use registry_operator::runtime::{signals, Bootstrap, StartupError};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Configure rustls crypto provider (ring) before any TLS connection is made
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let operator = OperatorConfig::from_env();
    if let Err(e) = init_logging(&operator) {
        eprintln!("registry-operator: {e:#}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build_git_hash = env!("BUILD_GIT_HASH"),
        build_datetime = env!("BUILD_DATETIME"),
        build_timestamp = env!("BUILD_TIMESTAMP"),
        "Starting registry operator"
    );

    let cancel = CancellationToken::new();
    let signals = signals::cancel_on_signal(cancel.clone());

    let result = run(&args, operator, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = signals.await {
        debug!(error = %e, "signal task ended abnormally");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "registry operator exiting");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &OperatorConfig) -> Result<()> {
    logging::init(config)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize logging")
}

async fn run(args: &Args, operator: OperatorConfig, cancel: CancellationToken) -> Result<(), StartupError> {
    let settings = Settings::load(args, operator)?;
    let connector = KubeConnector::infer().await.map_err(CleanupError::Connect)?;
    Bootstrap::new(settings, Arc::new(connector))?.run(cancel).await
}
