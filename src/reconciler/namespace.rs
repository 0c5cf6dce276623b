//! # Namespace Reconciler
//!
//! Seeds the registry access secrets into every active namespace outside
//! the excluded set.

use super::secret_service::is_active;
use super::{Dependencies, ReconcileError, SetupError, SetupWithManager};
use crate::client::ObjectKey;
use crate::manager::{Action, Manager, Reconcile, Registration};
use crate::scheme::kinds;
use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct NamespaceReconciler {
    deps: Dependencies,
    gvk: GroupVersionKind,
}

impl NamespaceReconciler {
    pub const NAME: &'static str = "namespace";

    pub fn new(deps: Dependencies) -> Self {
        Self {
            deps,
            gvk: kinds::gvk(kinds::namespace),
        }
    }
}

#[async_trait]
impl Reconcile for NamespaceReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let namespace = match self.deps.client.get(&self.gvk, key).await? {
            Some(ns) if is_active(&ns) => ns,
            _ => {
                debug!(namespace = %key, "namespace gone or terminating");
                return Ok(Action::await_change());
            }
        };
        let name = namespace.metadata.name.as_deref().unwrap_or(&key.name);
        self.deps.secrets.ensure_namespace(name).await?;
        Ok(Action::requeue(self.deps.domain.namespace_requeue()))
    }

    fn error_requeue(&self) -> Duration {
        self.deps.domain.namespace_requeue()
    }
}

impl SetupWithManager for NamespaceReconciler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn setup_with_manager(self, manager: &mut Manager) -> Result<(), SetupError> {
        let span = self.deps.span.clone();
        let secrets = Arc::clone(&self.deps.secrets);
        let gvk = self.gvk.clone();
        manager.add(
            Registration::new(Self::NAME, gvk, Arc::new(self))
                .with_predicate(move |object: &DynamicObject| {
                    object
                        .metadata
                        .name
                        .as_deref()
                        .is_some_and(|name| !secrets.is_excluded(name))
                })
                .with_span(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::client::ClusterApi;
    use crate::config::DomainConfig;
    use crate::manager::events::EventRecorder;
    use crate::reconciler::{ManifestInstaller, SecretService};
    use crate::scheme::kinds::default_registry;
    use k8s_openapi::api::core::v1::{Namespace, NamespaceStatus, Secret};
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use tracing::Span;

    fn deps(cluster: &FakeCluster) -> Dependencies {
        let client: Arc<dyn ClusterApi> = Arc::new(cluster.client(default_registry().unwrap()));
        let domain = Arc::new(DomainConfig::default());
        Dependencies {
            secrets: Arc::new(SecretService::new(
                Arc::clone(&client),
                Arc::clone(&domain),
                "test",
            )),
            chart: Arc::new(ManifestInstaller::new("/module-chart", Arc::clone(&client), "test")),
            client,
            cluster_config: Arc::new(kube::Config::new("https://localhost".parse().unwrap())),
            recorder: EventRecorder::new("test", cluster.recorded_events()),
            span: Span::none(),
            domain,
        }
    }

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

    fn seed_base_secret(cluster: &FakeCluster) {
        cluster
            .seed(&Secret {
                metadata: ObjectMeta {
                    name: Some("dockerregistry-config".to_string()),
                    namespace: Some("kyma-system".to_string()),
                    ..ObjectMeta::default()
                },
                data: Some(BTreeMap::from([(
                    "username".to_string(),
                    ByteString(b"admin".to_vec()),
                )])),
                ..Secret::default()
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_namespace_receives_base_secret() {
        let cluster = FakeCluster::new();
        seed_base_secret(&cluster);
        cluster.seed(&namespace("team-a", "Active")).unwrap();
        let reconciler = NamespaceReconciler::new(deps(&cluster));

        let action = reconciler.reconcile(&ObjectKey::cluster("team-a")).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert!(cluster
            .object(
                &kinds::gvk(kinds::secret),
                &ObjectKey::namespaced("team-a", "dockerregistry-config")
            )
            .is_some());
    }

    #[tokio::test]
    async fn test_terminating_namespace_is_skipped() {
        let cluster = FakeCluster::new();
        seed_base_secret(&cluster);
        cluster.seed(&namespace("team-b", "Terminating")).unwrap();
        let reconciler = NamespaceReconciler::new(deps(&cluster));

        let action = reconciler.reconcile(&ObjectKey::cluster("team-b")).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(cluster
            .object(
                &kinds::gvk(kinds::secret),
                &ObjectKey::namespaced("team-b", "dockerregistry-config")
            )
            .is_none());
    }
}
