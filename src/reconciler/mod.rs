//! # Reconcilers
//!
//! The operator runs a fixed set of three reconcilers:
//!
//! - `docker_registry` - installs the registry chart for `DockerRegistry` resources
//! - `namespace` - seeds registry access secrets into new namespaces
//! - `secret` - re-propagates the base access secrets when they change
//!
//! Shared pieces:
//!
//! - `chart` - opaque chart installation
//! - `secret_service` - secret copy/propagation used by the last two
//!
//! Every reconciler receives the same [`Dependencies`] bundle and wires itself
//! into the Manager through [`SetupWithManager`].

pub mod chart;
mod docker_registry;
mod namespace;
mod secret;
pub mod secret_service;

pub use chart::{ChartError, ChartInstaller, ManifestInstaller};
pub use docker_registry::DockerRegistryReconciler;
pub use namespace::NamespaceReconciler;
pub use secret::SecretReconciler;
pub use secret_service::SecretService;

use crate::client::{ClientError, ClusterApi};
use crate::config::DomainConfig;
use crate::manager::events::EventRecorder;
use crate::manager::Manager;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info_span, Span};

/// Errors raised while wiring a reconciler into the Manager
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("controller {controller} has an invalid watch: {reason}")]
    InvalidWatch { controller: String, reason: String },

    #[error("controller {0} is already registered")]
    Duplicate(String),
}

/// Errors from a single reconcile; logged, counted and requeued
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("chart installation failed: {0}")]
    Chart(#[from] ChartError),

    #[error("failed to encode status: {0}")]
    Status(#[from] serde_json::Error),
}

/// Everything a reconciler may use, handed out once at registration
#[derive(Debug, Clone)]
pub struct Dependencies {
    /// Manager client: cached reads, live writes
    pub client: Arc<dyn ClusterApi>,
    pub cluster_config: Arc<kube::Config>,
    pub recorder: EventRecorder,
    /// Logging context; every reconcile of the controller runs inside it
    pub span: Span,
    pub domain: Arc<DomainConfig>,
    pub secrets: Arc<SecretService>,
    pub chart: Arc<dyn ChartInstaller>,
}

impl Dependencies {
    /// Assemble the bundle from a constructed Manager
    pub fn new(
        manager: &Manager,
        reporter: &str,
        domain: DomainConfig,
        chart: Arc<dyn ChartInstaller>,
    ) -> Self {
        let client = manager.client();
        let domain = Arc::new(domain);
        let secrets = Arc::new(SecretService::new(
            Arc::clone(&client),
            Arc::clone(&domain),
            reporter,
        ));
        Self {
            client,
            cluster_config: Arc::new(manager.cluster_config().clone()),
            recorder: manager.event_recorder_for(reporter),
            span: Span::none(),
            domain,
            secrets,
            chart,
        }
    }

    /// Copy of the bundle with its own logging context
    #[must_use]
    pub fn for_controller(&self, controller: &str) -> Self {
        Self {
            span: info_span!("controller", controller = %controller),
            ..self.clone()
        }
    }
}

/// Wiring of one reconciler into the Manager
pub trait SetupWithManager {
    /// Controller name, unique per Manager
    fn name(&self) -> &'static str;

    fn setup_with_manager(self, manager: &mut Manager) -> Result<(), SetupError>;
}

/// The closed set of reconcilers the operator runs
#[derive(Debug)]
pub enum Reconciler {
    DockerRegistry(DockerRegistryReconciler),
    Namespace(NamespaceReconciler),
    Secret(SecretReconciler),
}

impl Reconciler {
    /// Every reconciler, in registration order
    pub fn all(deps: &Dependencies) -> Vec<Reconciler> {
        vec![
            Reconciler::DockerRegistry(DockerRegistryReconciler::new(
                deps.for_controller(DockerRegistryReconciler::NAME),
            )),
            Reconciler::Namespace(NamespaceReconciler::new(
                deps.for_controller(NamespaceReconciler::NAME),
            )),
            Reconciler::Secret(SecretReconciler::new(
                deps.for_controller(SecretReconciler::NAME),
            )),
        ]
    }
}

impl SetupWithManager for Reconciler {
    fn name(&self) -> &'static str {
        match self {
            Reconciler::DockerRegistry(r) => r.name(),
            Reconciler::Namespace(r) => r.name(),
            Reconciler::Secret(r) => r.name(),
        }
    }

    fn setup_with_manager(self, manager: &mut Manager) -> Result<(), SetupError> {
        match self {
            Reconciler::DockerRegistry(r) => r.setup_with_manager(manager),
            Reconciler::Namespace(r) => r.setup_with_manager(manager),
            Reconciler::Secret(r) => r.setup_with_manager(manager),
        }
    }
}
