//! # Configuration
//!
//! Operator settings come from three places:
//!
//! - `operator` - process settings from environment variables
//! - `domain` - reconciler settings (namespaces, secret names, requeue intervals),
//!   defaults or a YAML file
//! - `cli` - the two listener addresses from command-line flags

pub mod cli;
mod domain;
mod operator;

pub use domain::DomainConfig;
pub use operator::OperatorConfig;

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling the operator settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address '{address}': {reason}")]
    BindAddress { address: String, reason: String },

    #[error("failed to read domain config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse domain config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything the startup pipeline needs, resolved before the first phase runs
#[derive(Debug, Clone)]
pub struct Settings {
    pub operator: OperatorConfig,
    pub domain: DomainConfig,
    /// `None` disables the metrics listener
    pub metrics_bind_address: Option<SocketAddr>,
    pub health_probe_bind_address: SocketAddr,
}

impl Settings {
    /// Combine flags, environment and the optional domain config file
    pub fn load(args: &cli::Args, operator: OperatorConfig) -> Result<Self, ConfigError> {
        let domain = match &operator.domain_config_path {
            Some(path) => DomainConfig::from_file(path)?,
            None => DomainConfig::default(),
        };
        operator.validate()?;
        domain.validate()?;

        Ok(Self {
            metrics_bind_address: args.metrics_address()?,
            health_probe_bind_address: args.health_probe_address()?,
            operator,
            domain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let settings = Settings::load(&cli::Args::default(), OperatorConfig::default()).unwrap();
        assert_eq!(settings.health_probe_bind_address.port(), 8081);
        assert_eq!(settings.metrics_bind_address.map(|a| a.port()), Some(8080));
        assert_eq!(settings.domain, DomainConfig::default());
    }

    #[test]
    fn test_zero_sync_period_is_rejected() {
        let operator = OperatorConfig {
            sync_period_secs: 0,
            ..OperatorConfig::default()
        };
        let err = Settings::load(&cli::Args::default(), operator).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref reason) if reason.contains("SYNC_PERIOD_SECS")));
    }
}
