//! # Secret Service
//!
//! Copies the registry access secrets from the base namespace into user
//! namespaces. Each copy keeps the base secret's type and data and is stamped
//! with the operator's `managed-by` label, which is also what marks a copy as
//! safe to remove.

use crate::client::{from_dynamic, to_dynamic, ClientError, ClusterApi, ObjectKey};
use crate::config::DomainConfig;
use crate::constants::MANAGED_BY_LABEL;
use crate::scheme::kinds;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct SecretService {
    client: Arc<dyn ClusterApi>,
    domain: Arc<DomainConfig>,
    managed_by: String,
    secret_gvk: GroupVersionKind,
    namespace_gvk: GroupVersionKind,
}

impl SecretService {
    pub fn new(client: Arc<dyn ClusterApi>, domain: Arc<DomainConfig>, managed_by: &str) -> Self {
        Self {
            client,
            domain,
            managed_by: managed_by.to_string(),
            secret_gvk: kinds::gvk(kinds::secret),
            namespace_gvk: kinds::gvk(kinds::namespace),
        }
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.domain.is_excluded(namespace)
    }

    /// True for the internal or external access secret in the base namespace
    pub fn is_base_secret(&self, object: &DynamicObject) -> bool {
        object.metadata.namespace.as_deref() == Some(self.domain.base_namespace.as_str())
            && object
                .metadata
                .name
                .as_deref()
                .is_some_and(|name| self.domain.base_secret_names().contains(&name))
    }

    /// Base secrets that currently exist
    pub async fn base_secrets(&self) -> Result<Vec<Secret>, ClientError> {
        let mut secrets = Vec::new();
        for name in self.domain.base_secret_names() {
            let key = ObjectKey::namespaced(&self.domain.base_namespace, name);
            if let Some(object) = self.client.get(&self.secret_gvk, &key).await? {
                secrets.push(from_dynamic(object)?);
            }
        }
        Ok(secrets)
    }

    /// Make sure `namespace` holds a copy of every base secret
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<usize, ClientError> {
        if self.is_excluded(namespace) {
            return Ok(0);
        }
        let bases = self.base_secrets().await?;
        for base in &bases {
            self.apply_copy(base, namespace).await?;
        }
        if !bases.is_empty() {
            debug!(namespace, copies = bases.len(), "namespace secrets ensured");
        }
        Ok(bases.len())
    }

    /// Copy `base` into every active, non-excluded namespace
    pub async fn propagate(&self, base: &Secret) -> Result<usize, ClientError> {
        let mut copied = 0;
        for namespace in self.target_namespaces().await? {
            self.apply_copy(base, &namespace).await?;
            copied += 1;
        }
        info!(
            secret = base.metadata.name.as_deref().unwrap_or_default(),
            namespaces = copied,
            "base secret propagated"
        );
        Ok(copied)
    }

    /// Delete every operator-managed copy named `name`
    pub async fn remove_copies(&self, name: &str) -> Result<usize, ClientError> {
        let mut removed = 0;
        for namespace in self.target_namespaces().await? {
            let key = ObjectKey::namespaced(&namespace, name);
            let Some(copy) = self.client.get(&self.secret_gvk, &key).await? else {
                continue;
            };
            if self.is_managed(&copy) && self.client.delete(&self.secret_gvk, &key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(secret = name, copies = removed, "stale secret copies removed");
        }
        Ok(removed)
    }

    fn is_managed(&self, object: &DynamicObject) -> bool {
        object
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MANAGED_BY_LABEL))
            .is_some_and(|value| *value == self.managed_by)
    }

    async fn target_namespaces(&self) -> Result<Vec<String>, ClientError> {
        let namespaces = self.client.list(&self.namespace_gvk, None).await?;
        Ok(namespaces
            .iter()
            .filter(|ns| is_active(ns))
            .filter_map(|ns| ns.metadata.name.clone())
            .filter(|name| !self.is_excluded(name))
            .collect())
    }

    async fn apply_copy(&self, base: &Secret, namespace: &str) -> Result<(), ClientError> {
        let copy = copy_for(base, namespace, &self.managed_by)?;
        self.client.apply(&self.secret_gvk, &to_dynamic(&copy)?).await?;
        Ok(())
    }
}

/// Namespaces being torn down no longer accept new objects
pub fn is_active(namespace: &DynamicObject) -> bool {
    namespace.metadata.deletion_timestamp.is_none()
        && namespace
            .data
            .pointer("/status/phase")
            .and_then(serde_json::Value::as_str)
            != Some("Terminating")
}

fn copy_for(base: &Secret, namespace: &str, managed_by: &str) -> Result<Secret, ClientError> {
    let name = base
        .metadata
        .name
        .clone()
        .ok_or(ClientError::Incomplete("metadata.name"))?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                managed_by.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        type_: base.type_.clone(),
        data: base.data.clone(),
        ..Secret::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::constants::OPERATOR_NAME;
    use crate::scheme::kinds::default_registry;
    use k8s_openapi::api::core::v1::{Namespace, NamespaceStatus};
    use k8s_openapi::ByteString;

    fn namespace(name: &str, phase: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(NamespaceStatus {
                phase: Some(phase.to_string()),
                ..NamespaceStatus::default()
            }),
            ..Namespace::default()
        }
    }

    fn base_secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kyma-system".to_string()),
                ..ObjectMeta::default()
            },
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            data: Some(BTreeMap::from([(
                ".dockerconfigjson".to_string(),
                ByteString(b"{}".to_vec()),
            )])),
            ..Secret::default()
        }
    }

    fn service(cluster: &FakeCluster) -> SecretService {
        let client = Arc::new(cluster.client(default_registry().unwrap()));
        SecretService::new(client, Arc::new(DomainConfig::default()), OPERATOR_NAME)
    }

    fn copy_in(cluster: &FakeCluster, namespace: &str, name: &str) -> Option<Secret> {
        cluster
            .object(&kinds::gvk(kinds::secret), &ObjectKey::namespaced(namespace, name))
            .map(|o| from_dynamic(o).unwrap())
    }

    #[tokio::test]
    async fn test_ensure_namespace_copies_existing_base_secrets() {
        let cluster = FakeCluster::new();
        cluster.seed(&base_secret("dockerregistry-config")).unwrap();
        let service = service(&cluster);

        assert_eq!(service.ensure_namespace("team-a").await.unwrap(), 1);
        let copy = copy_in(&cluster, "team-a", "dockerregistry-config").unwrap();
        assert_eq!(copy.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        assert_eq!(
            copy.metadata.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(OPERATOR_NAME)
        );
        assert!(copy_in(&cluster, "team-a", "dockerregistry-config-external").is_none());
    }

    #[tokio::test]
    async fn test_excluded_namespace_gets_nothing() {
        let cluster = FakeCluster::new();
        cluster.seed(&base_secret("dockerregistry-config")).unwrap();
        let service = service(&cluster);
        assert_eq!(service.ensure_namespace("kyma-system").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_propagate_skips_excluded_and_terminating_namespaces() {
        let cluster = FakeCluster::new();
        for ns in [
            namespace("team-a", "Active"),
            namespace("team-b", "Active"),
            namespace("leaving", "Terminating"),
            namespace("kyma-system", "Active"),
        ] {
            cluster.seed(&ns).unwrap();
        }
        let service = service(&cluster);

        let copied = service
            .propagate(&base_secret("dockerregistry-config"))
            .await
            .unwrap();
        assert_eq!(copied, 2);
        assert!(copy_in(&cluster, "team-b", "dockerregistry-config").is_some());
        assert!(copy_in(&cluster, "leaving", "dockerregistry-config").is_none());
    }

    #[tokio::test]
    async fn test_remove_copies_leaves_foreign_secrets() {
        let cluster = FakeCluster::new();
        cluster.seed(&namespace("team-a", "Active")).unwrap();
        cluster.seed(&namespace("team-b", "Active")).unwrap();
        let service = service(&cluster);
        service
            .propagate(&base_secret("dockerregistry-config"))
            .await
            .unwrap();
        // a user-owned secret with the same name in team-b
        let mut foreign = base_secret("dockerregistry-config");
        foreign.metadata.namespace = Some("team-b".to_string());
        cluster.seed(&foreign).unwrap();

        assert_eq!(service.remove_copies("dockerregistry-config").await.unwrap(), 1);
        assert!(copy_in(&cluster, "team-a", "dockerregistry-config").is_none());
        assert!(copy_in(&cluster, "team-b", "dockerregistry-config").is_some());
    }

    #[test]
    fn test_base_secret_detection() {
        let cluster = FakeCluster::new();
        let service = service(&cluster);
        let base = to_dynamic(&base_secret("dockerregistry-config-external")).unwrap();
        assert!(service.is_base_secret(&base));

        let mut elsewhere = base_secret("dockerregistry-config");
        elsewhere.metadata.namespace = Some("default".to_string());
        assert!(!service.is_base_secret(&to_dynamic(&elsewhere).unwrap()));
    }
}
