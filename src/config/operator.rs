//! # Operator Configuration
//!
//! Process-level settings loaded from environment variables.

use crate::constants::{
    DEFAULT_CHART_PATH, DEFAULT_CLEANUP_TIMEOUT_SECS, DEFAULT_SYNC_PERIOD_SECS, OPERATOR_NAME,
};
use super::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

/// Operator-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Directory holding the rendered registry manifests
    pub chart_path: PathBuf,
    /// Informer full-resync period (seconds)
    pub sync_period_secs: u64,
    /// Deadline for the startup orphan cleanup (seconds)
    pub cleanup_timeout_secs: u64,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
    /// Optional YAML file overriding [`super::DomainConfig`] defaults
    pub domain_config_path: Option<PathBuf>,
    /// Field manager, event reporter and `managed-by` label value
    pub operator_name: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            chart_path: PathBuf::from(DEFAULT_CHART_PATH),
            sync_period_secs: DEFAULT_SYNC_PERIOD_SECS,
            cleanup_timeout_secs: DEFAULT_CLEANUP_TIMEOUT_SECS,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            domain_config_path: None,
            operator_name: OPERATOR_NAME.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            chart_path: lookup("CHART_PATH").map_or(defaults.chart_path, PathBuf::from),
            sync_period_secs: parsed("SYNC_PERIOD_SECS", defaults.sync_period_secs),
            cleanup_timeout_secs: parsed("CLEANUP_TIMEOUT_SECS", defaults.cleanup_timeout_secs),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT").unwrap_or(defaults.log_format),
            domain_config_path: lookup("DOMAIN_CONFIG_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            operator_name: lookup("OPERATOR_NAME").unwrap_or(defaults.operator_name),
        }
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        // a zero period re-opens every informer watch in a tight loop
        if self.sync_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "SYNC_PERIOD_SECS must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get informer resync duration
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    /// Get orphan cleanup deadline
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}
