//! # Secret Reconciler
//!
//! Watches the base access secrets and keeps their copies in user
//! namespaces in step: a change is propagated everywhere, a removal takes
//! the operator-managed copies with it.

use super::{Dependencies, ReconcileError, SetupError, SetupWithManager};
use crate::client::{from_dynamic, ObjectKey};
use crate::manager::{Action, Manager, Reconcile, Registration};
use crate::scheme::kinds;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::core::{DynamicObject, GroupVersionKind};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct SecretReconciler {
    deps: Dependencies,
    gvk: GroupVersionKind,
}

impl SecretReconciler {
    pub const NAME: &'static str = "secret";

    pub fn new(deps: Dependencies) -> Self {
        Self {
            deps,
            gvk: kinds::gvk(kinds::secret),
        }
    }
}

#[async_trait]
impl Reconcile for SecretReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        // Secrets are never cached; this read goes to the API server
        match self.deps.client.get(&self.gvk, key).await? {
            None => {
                self.deps.secrets.remove_copies(&key.name).await?;
                Ok(Action::await_change())
            }
            Some(object) => {
                let base: Secret = from_dynamic(object)?;
                self.deps.secrets.propagate(&base).await?;
                Ok(Action::requeue(self.deps.domain.secret_requeue()))
            }
        }
    }

    fn error_requeue(&self) -> Duration {
        self.deps.domain.secret_requeue()
    }
}

impl SetupWithManager for SecretReconciler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn setup_with_manager(self, manager: &mut Manager) -> Result<(), SetupError> {
        let domain = &self.deps.domain;
        if domain.base_namespace.trim().is_empty()
            || domain.base_secret_names().iter().any(|name| name.trim().is_empty())
        {
            return Err(SetupError::InvalidWatch {
                controller: Self::NAME.to_string(),
                reason: "base namespace and secret names must not be empty".to_string(),
            });
        }

        let span = self.deps.span.clone();
        let secrets = Arc::clone(&self.deps.secrets);
        let gvk = self.gvk.clone();
        manager.add(
            Registration::new(Self::NAME, gvk, Arc::new(self))
                .with_predicate(move |object: &DynamicObject| secrets.is_base_secret(object))
                .with_span(span),
        )
    }
}
