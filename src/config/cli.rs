//! # Command-line flags
//!
//! Only the two listener addresses are exposed as flags; everything else is
//! read from the environment by [`super::OperatorConfig`].

use super::ConfigError;
use crate::constants::{DEFAULT_HEALTH_PROBE_BIND_ADDRESS, DEFAULT_METRICS_BIND_ADDRESS};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "registry-operator")]
#[command(about = "Installs the in-cluster Docker registry and propagates its access secrets", long_about = None)]
#[command(version)]
pub struct Args {
    /// The address the metric endpoint binds to; "0" disables it
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = DEFAULT_METRICS_BIND_ADDRESS)]
    pub metrics_bind_address: String,

    /// The address the probe endpoint binds to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = DEFAULT_HEALTH_PROBE_BIND_ADDRESS)]
    pub health_probe_bind_address: String,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            metrics_bind_address: DEFAULT_METRICS_BIND_ADDRESS.to_string(),
            health_probe_bind_address: DEFAULT_HEALTH_PROBE_BIND_ADDRESS.to_string(),
        }
    }
}

impl Args {
    pub fn metrics_address(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.metrics_bind_address.trim() == "0" {
            return Ok(None);
        }
        parse_bind_address(&self.metrics_bind_address).map(Some)
    }

    pub fn health_probe_address(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind_address(&self.health_probe_bind_address)
    }
}

/// Parse `host:port`; a bare `:port` binds every IPv4 interface
pub fn parse_bind_address(raw: &str) -> Result<SocketAddr, ConfigError> {
    let raw = raw.trim();
    let invalid = |reason: String| ConfigError::BindAddress {
        address: raw.to_string(),
        reason,
    };

    if let Some(port) = raw.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|e: std::num::ParseIntError| invalid(format!("bad port: {e}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    raw.parse::<SocketAddr>()
        .map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_only_binds_all_interfaces() {
        let addr = parse_bind_address(":8080").unwrap();
        assert_eq!(addr, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn test_explicit_host() {
        let addr = parse_bind_address("127.0.0.1:9443").unwrap();
        assert_eq!(addr.port(), 9443);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_invalid_addresses() {
        for raw in [":http", "localhost", ":70000", ""] {
            assert!(
                matches!(parse_bind_address(raw), Err(ConfigError::BindAddress { .. })),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_flag_defaults() {
        let args = Args::try_parse_from(["registry-operator"]).unwrap();
        assert_eq!(args.health_probe_address().unwrap().port(), 8081);
        assert_eq!(args.metrics_address().unwrap().map(|a| a.port()), Some(8080));
    }

    #[test]
    fn test_metrics_can_be_disabled() {
        let args = Args::try_parse_from(["registry-operator", "--metrics-bind-address", "0"]).unwrap();
        assert_eq!(args.metrics_address().unwrap(), None);
    }
}
