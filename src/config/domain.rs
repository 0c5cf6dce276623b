//! # Domain Configuration
//!
//! Settings shared by the reconcilers through the dependency bundle.

use super::ConfigError;
use crate::constants::{
    DEFAULT_BASE_NAMESPACE, DEFAULT_REQUEUE_SECS, EXTERNAL_ACCESS_SECRET_NAME,
    INTERNAL_ACCESS_SECRET_NAME,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconciler-facing configuration
///
/// # Example
///
/// ```yaml
/// baseNamespace: kyma-system
/// baseInternalSecretName: dockerregistry-config
/// baseExternalSecretName: dockerregistry-config-external
/// excludedNamespaces:
///   - kyma-system
///   - kube-system
/// secretRequeueSecs: 30
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainConfig {
    /// Namespace the registry and its base secrets live in
    pub base_namespace: String,
    pub base_internal_secret_name: String,
    pub base_external_secret_name: String,
    /// Namespaces that never receive secret copies
    pub excluded_namespaces: Vec<String>,
    pub docker_registry_requeue_secs: u64,
    pub namespace_requeue_secs: u64,
    pub secret_requeue_secs: u64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            base_namespace: DEFAULT_BASE_NAMESPACE.to_string(),
            base_internal_secret_name: INTERNAL_ACCESS_SECRET_NAME.to_string(),
            base_external_secret_name: EXTERNAL_ACCESS_SECRET_NAME.to_string(),
            excluded_namespaces: vec![DEFAULT_BASE_NAMESPACE.to_string()],
            docker_registry_requeue_secs: DEFAULT_REQUEUE_SECS,
            namespace_requeue_secs: DEFAULT_REQUEUE_SECS,
            secret_requeue_secs: DEFAULT_REQUEUE_SECS,
        }
    }
}

impl DomainConfig {
    /// Load from a YAML file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("baseNamespace must not be empty".to_string()));
        }
        if self.base_internal_secret_name.trim().is_empty()
            || self.base_external_secret_name.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "base secret names must not be empty".to_string(),
            ));
        }
        if self.base_internal_secret_name == self.base_external_secret_name {
            return Err(ConfigError::Invalid(format!(
                "internal and external secret share the name '{}'",
                self.base_internal_secret_name
            )));
        }
        Ok(())
    }

    /// Names of the secrets copied into user namespaces
    pub fn base_secret_names(&self) -> [&str; 2] {
        [&self.base_internal_secret_name, &self.base_external_secret_name]
    }

    /// Namespaces that are skipped by propagation; the base namespace always is
    pub fn is_excluded(&self, namespace: &str) -> bool {
        namespace == self.base_namespace || self.excluded_namespaces.iter().any(|n| n == namespace)
    }

    pub fn docker_registry_requeue(&self) -> Duration {
        Duration::from_secs(self.docker_registry_requeue_secs)
    }

    pub fn namespace_requeue(&self) -> Duration {
        Duration::from_secs(self.namespace_requeue_secs)
    }

    pub fn secret_requeue(&self) -> Duration {
        Duration::from_secs(self.secret_requeue_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DomainConfig::default();
        assert_eq!(config.base_namespace, "kyma-system");
        assert_eq!(
            config.base_secret_names(),
            ["dockerregistry-config", "dockerregistry-config-external"]
        );
        assert_eq!(config.secret_requeue(), Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "excludedNamespaces:\n  - kube-system\n  - istio-system\nsecretRequeueSecs: 5"
        )
        .unwrap();

        let config = DomainConfig::from_file(file.path()).unwrap();
        assert_eq!(config.secret_requeue(), Duration::from_secs(5));
        assert_eq!(config.namespace_requeue(), Duration::from_secs(60));
        assert_eq!(config.base_namespace, "kyma-system");
        assert!(config.is_excluded("istio-system"));
        // base namespace stays excluded even when the list omits it
        assert!(config.is_excluded("kyma-system"));
        assert!(!config.is_excluded("default"));
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "excludedNamespaces: {{ nope").unwrap();
        let err = DomainConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = DomainConfig::from_file(Path::new("/nonexistent/domain.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validate_rejects_shared_secret_names() {
        let config = DomainConfig {
            base_external_secret_name: INTERNAL_ACCESS_SECRET_NAME.to_string(),
            ..DomainConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
