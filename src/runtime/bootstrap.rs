//! # Startup Pipeline
//!
//! Drives the operator from an empty process to a running Manager:
//!
//! 1. `Initializing` - build the type registry
//! 2. `CleaningUp` - connect a direct client, delete orphans, drop the client
//! 3. `Registering` - construct the Manager, register every reconciler and
//!    the probe checks, commit the registrations
//! 4. `Running` - run the Manager until the token is cancelled
//!
//! Phases run strictly in order and the first error ends the pipeline. The
//! lifecycle always finishes in `Terminated`, whatever the outcome.

use super::lifecycle::{Lifecycle, Phase};
use super::StartupError;
use crate::cleanup::{self, default_targets, CleanupError, CleanupOutcome, DeprecatedResource};
use crate::client::Connector;
use crate::config::Settings;
use crate::manager::health::ping;
use crate::manager::{Manager, ManagerOptions};
use crate::observability::Metrics;
use crate::reconciler::{ChartInstaller, Dependencies, ManifestInstaller, Reconciler, SetupWithManager};
use crate::scheme::kinds::default_registry;
use crate::scheme::TypeRegistry;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Bootstrap {
    settings: Settings,
    connector: Arc<dyn Connector>,
    registry: Option<Arc<TypeRegistry>>,
    cleanup_targets: Vec<DeprecatedResource>,
    chart: Option<Arc<dyn ChartInstaller>>,
    lifecycle: Arc<Lifecycle>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("settings", &self.settings)
            .field("connector", &self.connector)
            .field("cleanup_targets", &self.cleanup_targets)
            .field("phase", &self.lifecycle.phase())
            .finish_non_exhaustive()
    }
}

impl Bootstrap {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Result<Self, StartupError> {
        let cleanup_targets = default_targets(&settings.operator.operator_name);
        Ok(Self {
            settings,
            connector,
            registry: None,
            cleanup_targets,
            chart: None,
            lifecycle: Arc::new(Lifecycle::new()),
            metrics: Arc::new(Metrics::new()?),
        })
    }

    /// Resolve kinds through `registry` instead of the built-in one
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the default orphan targets
    #[must_use]
    pub fn with_cleanup_targets(mut self, targets: Vec<DeprecatedResource>) -> Self {
        self.cleanup_targets = targets;
        self
    }

    /// Install charts with `chart` instead of the manifests under the chart path
    #[must_use]
    pub fn with_chart_installer(mut self, chart: Arc<dyn ChartInstaller>) -> Self {
        self.chart = Some(chart);
        self
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Run every phase, then the Manager, until `cancel` fires or something fails
    pub async fn run(self, cancel: CancellationToken) -> Result<(), StartupError> {
        let outcome = self.pipeline(&cancel).await;
        match &outcome {
            Ok(()) => info!("operator stopped"),
            Err(e) => error!(phase = %self.lifecycle.phase(), error = %e, "operator failed"),
        }
        if let Err(e) = self.enter(Phase::Terminated) {
            warn!(error = %e, "lifecycle already terminated");
        }
        outcome
    }

    async fn pipeline(&self, cancel: &CancellationToken) -> Result<(), StartupError> {
        self.metrics.set_phase(self.lifecycle.phase());
        let registry = match &self.registry {
            Some(registry) => Arc::clone(registry),
            None => default_registry()?,
        };
        info!(phase = %Phase::Initializing, kinds = registry.len(), "type registry built");
        self.checkpoint(cancel)?;

        self.enter(Phase::CleaningUp)?;
        let outcome = self.interruptible(cancel, self.clean(&registry)).await?;
        self.metrics.add_cleanup_deleted(outcome.deleted.len());
        info!(
            phase = %Phase::CleaningUp,
            scanned = outcome.scanned,
            deleted = outcome.deleted.len(),
            "orphan cleanup finished"
        );

        self.enter(Phase::Registering)?;
        let manager = self
            .interruptible(cancel, self.register(Arc::clone(&registry)))
            .await?;
        self.checkpoint(cancel)?;

        self.enter(Phase::Running)?;
        info!(
            phase = %Phase::Running,
            probes = ?manager.health_probe_address(),
            metrics = ?manager.metrics_address(),
            "operator running"
        );
        manager.start(cancel.clone()).await?;
        Ok(())
    }

    /// One-shot cleanup; the direct client does not outlive this call
    async fn clean(&self, registry: &Arc<TypeRegistry>) -> Result<CleanupOutcome, StartupError> {
        let direct = self
            .connector
            .connect(Arc::clone(registry))
            .await
            .map_err(CleanupError::Connect)?;
        let timeout = self.settings.operator.cleanup_timeout();
        Ok(cleanup::cleanup(direct.as_ref(), &self.cleanup_targets, timeout).await?)
    }

    async fn register(&self, registry: Arc<TypeRegistry>) -> Result<Manager, StartupError> {
        let mut options = ManagerOptions::new(
            registry,
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.metrics),
        );
        options.sync_period = self.settings.operator.sync_period();
        options.metrics_bind_address = self.settings.metrics_bind_address;
        options.health_probe_bind_address = self.settings.health_probe_bind_address;

        let mut manager = Manager::new(self.connector.as_ref(), options).await?;

        let operator_name = self.settings.operator.operator_name.as_str();
        let chart = self.chart.clone().unwrap_or_else(|| {
            Arc::new(ManifestInstaller::new(
                &self.settings.operator.chart_path,
                manager.client(),
                operator_name,
            ))
        });
        let deps = Dependencies::new(&manager, operator_name, self.settings.domain.clone(), chart);

        for reconciler in Reconciler::all(&deps) {
            let name = reconciler.name();
            reconciler.setup_with_manager(&mut manager)?;
            info!(phase = %Phase::Registering, controller = name, "reconciler registered");
        }
        manager.add_healthz_check("healthz", ping())?;
        manager.add_readyz_check("readyz", ping())?;

        let committed = manager.commit_registrations();
        info!(phase = %Phase::Registering, controllers = committed, "registrations committed");
        Ok(manager)
    }

    fn enter(&self, phase: Phase) -> Result<(), StartupError> {
        self.lifecycle.advance(phase)?;
        self.metrics.set_phase(phase);
        Ok(())
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), StartupError> {
        if cancel.is_cancelled() {
            return Err(StartupError::Interrupted {
                phase: self.lifecycle.phase(),
            });
        }
        Ok(())
    }

    /// Abandon a startup step as soon as shutdown is requested
    async fn interruptible<T>(
        &self,
        cancel: &CancellationToken,
        step: impl Future<Output = Result<T, StartupError>>,
    ) -> Result<T, StartupError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StartupError::Interrupted {
                phase: self.lifecycle.phase(),
            }),
            result = step => result,
        }
    }
}
