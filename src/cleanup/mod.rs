//! # Orphan Cleanup
//!
//! One-shot pass run before the Manager exists. It removes resources left
//! behind by older operator versions, using a direct (uncached) client that
//! is dropped as soon as the pass is over.
//!
//! A target object is an orphan when nothing owns it and it either carries
//! the operator's `managed-by` label or is named explicitly by the target.
//! The whole pass shares one deadline and is never retried in-process.

use crate::client::{ClientError, ClusterApi, ObjectKey};
use crate::constants::{DEPRECATED_GITREPOSITORY_CRD, MANAGED_BY_LABEL};
use crate::scheme::kinds;
use kube::core::{DynamicObject, GroupVersionKind};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to build the direct client: {0}")]
    Connect(#[source] ClientError),

    #[error("failed to list {kind}: {source}")]
    List {
        kind: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to delete {kind} {name}: {source}")]
    Delete {
        kind: String,
        name: String,
        #[source]
        source: ClientError,
    },

    #[error("orphan cleanup did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

/// A kind the operator no longer manages, plus how to recognise its leftovers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprecatedResource {
    pub kind: GroupVersionKind,
    /// Restrict the search to one namespace; `None` lists everywhere
    pub namespace: Option<String>,
    /// Delete this object by name even without the managed-by label
    pub name: Option<String>,
    pub managed_by: String,
}

impl DeprecatedResource {
    /// Every object of `kind` labelled as managed by `managed_by`
    pub fn labelled(kind: GroupVersionKind, managed_by: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: None,
            managed_by: managed_by.to_string(),
        }
    }

    /// The single object `name` of `kind`
    pub fn named(kind: GroupVersionKind, name: &str, managed_by: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::labelled(kind, managed_by)
        }
    }

    #[must_use]
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn is_orphan(&self, object: &DynamicObject) -> bool {
        let owned = object
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| !refs.is_empty());
        if owned {
            return false;
        }
        let named = self.name.is_some() && object.metadata.name == self.name;
        let labelled = object
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MANAGED_BY_LABEL))
            .is_some_and(|value| *value == self.managed_by);
        named || labelled
    }
}

/// Leftovers of previous operator releases
pub fn default_targets(managed_by: &str) -> Vec<DeprecatedResource> {
    vec![DeprecatedResource::named(
        kinds::gvk(kinds::custom_resource_definition),
        DEPRECATED_GITREPOSITORY_CRD,
        managed_by,
    )]
}

/// Report of a successful pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// `Kind/[namespace/]name` of every removed object
    pub deleted: Vec<String>,
    /// Objects inspected across all targets
    pub scanned: usize,
}

/// Delete the orphans of every target within `timeout`
pub async fn cleanup(
    direct: &dyn ClusterApi,
    targets: &[DeprecatedResource],
    timeout: Duration,
) -> Result<CleanupOutcome, CleanupError> {
    match tokio::time::timeout(timeout, sweep(direct, targets)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => Err(CleanupError::DeadlineExceeded(timeout)),
    }
}

async fn sweep(
    direct: &dyn ClusterApi,
    targets: &[DeprecatedResource],
) -> Result<CleanupOutcome, CleanupError> {
    let mut outcome = CleanupOutcome::default();

    for target in targets {
        let kind = target.kind.kind.clone();
        let objects = direct
            .list(&target.kind, target.namespace.as_deref())
            .await
            .map_err(|source| CleanupError::List {
                kind: kind.clone(),
                source,
            })?;
        outcome.scanned += objects.len();

        for object in objects.iter().filter(|o| target.is_orphan(o)) {
            let Some(key) = ObjectKey::of(object) else {
                continue;
            };
            let removed = match direct.delete(&target.kind, &key).await {
                Ok(removed) => removed,
                Err(e) if e.is_not_found() => false,
                Err(source) => {
                    return Err(CleanupError::Delete {
                        kind,
                        name: key.to_string(),
                        source,
                    })
                }
            };
            if removed {
                info!(kind = %kind, object = %key, "orphaned resource deleted");
                outcome.deleted.push(format!("{kind}/{key}"));
            } else {
                debug!(kind = %kind, object = %key, "orphaned resource already gone");
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeCluster, Verb};
    use crate::constants::OPERATOR_NAME;
    use crate::scheme::kinds::default_registry;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn crd(name: &str) -> CustomResourceDefinition {
        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..CustomResourceDefinition::default()
        }
    }

    fn config_map(name: &str, managed: bool, owned: bool) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kyma-system".to_string()),
                labels: managed.then(|| {
                    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string())])
                }),
                owner_references: owned.then(|| {
                    vec![OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: "Deployment".to_string(),
                        name: "registry".to_string(),
                        uid: "1234".to_string(),
                        ..OwnerReference::default()
                    }]
                }),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_deletes_deprecated_crd_only() {
        let cluster = FakeCluster::new();
        cluster.seed(&crd(DEPRECATED_GITREPOSITORY_CRD)).unwrap();
        cluster.seed(&crd("functions.serverless.kyma-project.io")).unwrap();
        let direct = cluster.client(default_registry().unwrap());

        let outcome = cleanup(&direct, &default_targets(OPERATOR_NAME), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome.scanned, 2);
        assert_eq!(
            outcome.deleted,
            vec![format!("CustomResourceDefinition/{DEPRECATED_GITREPOSITORY_CRD}")]
        );
        assert_eq!(cluster.objects(&kinds::gvk(kinds::custom_resource_definition)).len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_clean_is_success() {
        let cluster = FakeCluster::new();
        let direct = cluster.client(default_registry().unwrap());
        let outcome = cleanup(&direct, &default_targets(OPERATOR_NAME), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, CleanupOutcome::default());
    }

    #[tokio::test]
    async fn test_owned_or_unlabelled_objects_are_kept() {
        let cluster = FakeCluster::new();
        cluster.seed(&config_map("orphan", true, false)).unwrap();
        cluster.seed(&config_map("owned", true, true)).unwrap();
        cluster.seed(&config_map("foreign", false, false)).unwrap();
        let direct = cluster.client(default_registry().unwrap());
        let targets = [DeprecatedResource::labelled(kinds::gvk(kinds::config_map), OPERATOR_NAME)
            .in_namespace("kyma-system")];

        let outcome = cleanup(&direct, &targets, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.deleted, vec!["ConfigMap/kyma-system/orphan".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported() {
        let cluster = FakeCluster::new();
        cluster.seed(&crd(DEPRECATED_GITREPOSITORY_CRD)).unwrap();
        cluster.fail(Verb::Delete, "CustomResourceDefinition", "forbidden");
        let direct = cluster.client(default_registry().unwrap());

        let err = cleanup(&direct, &default_targets(OPERATOR_NAME), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CleanupError::Delete { ref kind, .. } if kind == "CustomResourceDefinition"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cluster_exceeds_deadline() {
        let cluster = FakeCluster::new();
        cluster.set_latency(Duration::from_secs(30));
        let direct = cluster.client(default_registry().unwrap());

        let err = cleanup(&direct, &default_targets(OPERATOR_NAME), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CleanupError::DeadlineExceeded(d) if d == Duration::from_secs(10)));
    }
}
