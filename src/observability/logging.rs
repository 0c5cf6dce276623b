//! # Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the
//! configured `LOG_LEVEL`; `LOG_FORMAT=json` switches to structured output.

use crate::config::OperatorConfig;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(config: &OperatorConfig) -> String {
    let level = config.log_level.to_lowercase();
    format!("registry_operator={level},kube_runtime=warn,tower_http={level}")
}

pub fn init(config: &OperatorConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(config)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logs() {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    }
}
