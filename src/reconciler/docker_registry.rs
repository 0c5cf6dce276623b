//! # DockerRegistry Reconciler
//!
//! Installs the registry chart for every DockerRegistry resource and reports
//! the outcome through the resource status and Kubernetes events.

use super::{Dependencies, ReconcileError, SetupError, SetupWithManager};
use crate::client::{from_dynamic, ObjectKey};
use crate::crd::{Condition, DockerRegistry, DockerRegistryStatus, State};
use crate::manager::events::reasons;
use crate::manager::{Action, Manager, Reconcile, Registration};
use crate::scheme::kinds;
use async_trait::async_trait;
use chrono::Utc;
use kube::core::{DynamicObject, GroupVersionKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const INSTALLED_CONDITION: &str = "Installed";

#[derive(Debug)]
pub struct DockerRegistryReconciler {
    deps: Dependencies,
    gvk: GroupVersionKind,
}

impl DockerRegistryReconciler {
    pub const NAME: &'static str = "dockerregistry";

    pub fn new(deps: Dependencies) -> Self {
        Self {
            deps,
            gvk: kinds::gvk(kinds::docker_registry),
        }
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        current: Option<&DockerRegistryStatus>,
        desired: DockerRegistryStatus,
    ) -> Result<(), ReconcileError> {
        if current == Some(&desired) {
            return Ok(());
        }
        self.deps
            .client
            .patch_status(&self.gvk, key, serde_json::to_value(&desired)?)
            .await?;
        debug!(object = %key, state = %desired.state, "status updated");
        Ok(())
    }

    fn installed_status(&self, registry: &DockerRegistry) -> DockerRegistryStatus {
        let previous = registry.status.as_ref();
        let external = registry
            .spec
            .external_access
            .as_ref()
            .is_some_and(|access| access.enabled);
        DockerRegistryStatus {
            state: State::Ready,
            served: Some("True".to_string()),
            conditions: vec![condition(
                previous,
                "True",
                "Installed",
                "DockerRegistry installed",
            )],
            observed_generation: registry.metadata.generation,
            internal_access_secret_name: Some(self.deps.domain.base_internal_secret_name.clone()),
            external_access_secret_name: external
                .then(|| self.deps.domain.base_external_secret_name.clone()),
        }
    }
}

/// Installed condition carrying over the transition time when the status is unchanged
fn condition(
    previous: Option<&DockerRegistryStatus>,
    status: &str,
    reason: &str,
    message: &str,
) -> Condition {
    let last_transition_time = previous
        .and_then(|s| s.conditions.iter().find(|c| c.r#type == INSTALLED_CONDITION))
        .filter(|c| c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    Condition {
        r#type: INSTALLED_CONDITION.to_string(),
        status: status.to_string(),
        last_transition_time: Some(last_transition_time),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

#[async_trait]
impl Reconcile for DockerRegistryReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(object) = self.deps.client.get(&self.gvk, key).await? else {
            debug!(object = %key, "DockerRegistry gone");
            return Ok(Action::await_change());
        };
        let registry: DockerRegistry = from_dynamic(object.clone())?;
        let current = registry.status.clone();

        if registry.metadata.deletion_timestamp.is_some() {
            let desired = DockerRegistryStatus {
                state: State::Deleting,
                ..current.clone().unwrap_or_default()
            };
            if current.as_ref().map(|s| s.state) != Some(State::Deleting) {
                self.deps
                    .recorder
                    .normal(&object, reasons::DELETING, "DockerRegistry is being deleted")
                    .await;
            }
            self.write_status(key, current.as_ref(), desired).await?;
            return Ok(Action::await_change());
        }

        match self.deps.chart.install(&registry).await {
            Ok(applied) => {
                let desired = self.installed_status(&registry);
                if current.as_ref().map(|s| s.state) != Some(State::Ready) {
                    info!(object = %key, applied, "DockerRegistry installed");
                    self.deps
                        .recorder
                        .normal(&object, reasons::INSTALLED, format!("{applied} objects applied"))
                        .await;
                }
                self.write_status(key, current.as_ref(), desired).await?;
                Ok(Action::requeue(self.deps.domain.docker_registry_requeue()))
            }
            Err(e) => {
                warn!(object = %key, error = %e, "DockerRegistry installation failed");
                let desired = DockerRegistryStatus {
                    state: State::Error,
                    served: Some("True".to_string()),
                    conditions: vec![condition(
                        current.as_ref(),
                        "False",
                        "InstallationFailed",
                        &e.to_string(),
                    )],
                    observed_generation: registry.metadata.generation,
                    ..current.clone().unwrap_or_default()
                };
                self.deps
                    .recorder
                    .warning(&object, reasons::INSTALLATION_FAILED, e.to_string())
                    .await;
                self.write_status(key, current.as_ref(), desired).await?;
                Err(e.into())
            }
        }
    }

    fn error_requeue(&self) -> Duration {
        self.deps.domain.docker_registry_requeue()
    }
}

impl SetupWithManager for DockerRegistryReconciler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn setup_with_manager(self, manager: &mut Manager) -> Result<(), SetupError> {
        let span = self.deps.span.clone();
        let gvk = self.gvk.clone();
        manager.add(
            Registration::new(Self::NAME, gvk, Arc::new(self))
                .with_predicate(|object: &DynamicObject| object.metadata.name.is_some())
                .with_span(span),
        )
    }
}
