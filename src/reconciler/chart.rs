//! # Chart Installation
//!
//! The DockerRegistry reconciler treats chart installation as opaque: it
//! hands the resource to a [`ChartInstaller`] and only looks at the outcome.
//!
//! [`ManifestInstaller`] applies the pre-rendered manifests shipped in the
//! operator image. Every `*.yaml`/`*.yml` file under the chart path is read
//! in file-name order; multi-document files are supported. Namespaced
//! objects without a namespace land in the DockerRegistry's namespace.

use crate::client::{gvk_of, ClientError, ClusterApi};
use crate::constants::MANAGED_BY_LABEL;
use crate::crd::DockerRegistry;
use async_trait::async_trait;
use kube::core::DynamicObject;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("chart directory {0} does not exist")]
    Missing(PathBuf),

    #[error("failed to walk chart directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("manifest in {path} is missing {field}")]
    Incomplete { path: PathBuf, field: &'static str },

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[async_trait]
pub trait ChartInstaller: Send + Sync + fmt::Debug {
    /// Install or upgrade the registry for `registry`; returns the number of applied objects
    async fn install(&self, registry: &DockerRegistry) -> Result<usize, ChartError>;
}

/// Installer applying a directory of rendered manifests
#[derive(Debug)]
pub struct ManifestInstaller {
    chart_path: PathBuf,
    client: Arc<dyn ClusterApi>,
    managed_by: String,
}

impl ManifestInstaller {
    pub fn new(chart_path: impl Into<PathBuf>, client: Arc<dyn ClusterApi>, managed_by: &str) -> Self {
        Self {
            chart_path: chart_path.into(),
            client,
            managed_by: managed_by.to_string(),
        }
    }

    /// Read every manifest under the chart path
    pub fn load(&self) -> Result<Vec<(PathBuf, DynamicObject)>, ChartError> {
        if !self.chart_path.is_dir() {
            return Err(ChartError::Missing(self.chart_path.clone()));
        }

        let mut manifests = Vec::new();
        for entry in WalkDir::new(&self.chart_path).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() && is_yaml(entry.path()) {
                manifests.extend(
                    parse_file(entry.path())?
                        .into_iter()
                        .map(|object| (entry.path().to_path_buf(), object)),
                );
            }
        }
        Ok(manifests)
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

fn parse_file(path: &Path) -> Result<Vec<DynamicObject>, ChartError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ChartError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |source| ChartError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&raw) {
        let value = serde_yaml::Value::deserialize(document).map_err(parse_error)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value).map_err(parse_error)?);
    }
    Ok(objects)
}

#[async_trait]
impl ChartInstaller for ManifestInstaller {
    async fn install(&self, registry: &DockerRegistry) -> Result<usize, ChartError> {
        let target_namespace = registry.metadata.namespace.clone();
        let manifests = self.load()?;

        for (path, mut object) in manifests.iter().cloned() {
            let types = object.types.as_ref().ok_or_else(|| ChartError::Incomplete {
                path: path.clone(),
                field: "apiVersion/kind",
            })?;
            if object.metadata.name.is_none() {
                return Err(ChartError::Incomplete {
                    path,
                    field: "metadata.name",
                });
            }
            let gvk = gvk_of(types);
            let kind = self.client.registry().lookup(&gvk).map_err(ClientError::from)?;
            if kind.is_namespaced() && object.metadata.namespace.is_none() {
                object.metadata.namespace.clone_from(&target_namespace);
            }
            object
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(MANAGED_BY_LABEL.to_string(), self.managed_by.clone());

            self.client.apply(&gvk, &object).await?;
            debug!(kind = %kind.kind, name = ?object.metadata.name, "chart object applied");
        }
        Ok(manifests.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::client::ObjectKey;
    use crate::constants::OPERATOR_NAME;
    use crate::scheme::kinds::{self, default_registry};
    use kube::api::ObjectMeta;

    const REGISTRY_MANIFESTS: &str = r"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: internal-docker-registry
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: internal-docker-registry-config
data:
  config.yml: |
    version: 0.1
---
";

    fn registry_in(namespace: &str) -> DockerRegistry {
        DockerRegistry {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: crate::crd::DockerRegistrySpec::default(),
            status: None,
        }
    }

    fn installer(dir: &Path, cluster: &FakeCluster) -> ManifestInstaller {
        let client = Arc::new(cluster.client(default_registry().unwrap()));
        ManifestInstaller::new(dir, client, OPERATOR_NAME)
    }

    #[tokio::test]
    async fn test_installs_multi_document_manifests_into_registry_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("registry.yaml"), REGISTRY_MANIFESTS).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();
        let cluster = FakeCluster::new();

        let applied = installer(dir.path(), &cluster)
            .install(&registry_in("kyma-system"))
            .await
            .unwrap();
        assert_eq!(applied, 2);

        let account = cluster
            .object(
                &kinds::gvk(kinds::service_account),
                &ObjectKey::namespaced("kyma-system", "internal-docker-registry"),
            )
            .unwrap();
        assert_eq!(
            account
                .metadata
                .labels
                .unwrap()
                .get(MANAGED_BY_LABEL)
                .map(String::as_str),
            Some(OPERATOR_NAME)
        );
    }

    #[tokio::test]
    async fn test_missing_chart_directory() {
        let cluster = FakeCluster::new();
        let err = installer(Path::new("/nonexistent/module-chart"), &cluster)
            .install(&registry_in("kyma-system"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChartError::Missing(_)));
    }

    #[tokio::test]
    async fn test_unregistered_kind_in_chart_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hpa.yaml"),
            "apiVersion: autoscaling/v2\nkind: HorizontalPodAutoscaler\nmetadata:\n  name: registry\n",
        )
        .unwrap();
        let cluster = FakeCluster::new();
        let err = installer(dir.path(), &cluster)
            .install(&registry_in("kyma-system"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChartError::Client(ClientError::UnregisteredKind(_))
        ));
    }

    #[test]
    fn test_broken_yaml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yml"), "kind: [unterminated").unwrap();
        let cluster = FakeCluster::new();
        match installer(dir.path(), &cluster).load() {
            Err(ChartError::Parse { path, .. }) => assert!(path.ends_with("broken.yml")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
