//! # Manager
//!
//! Owns everything the reconcilers share once the process is running: the
//! cached client, the informer cache, the probe and metrics listeners, the
//! event recorder factory and the controller registrations.
//!
//! - `controller` - `kube_runtime::Controller` per registration
//! - `events` - Kubernetes event recording
//! - `health` - liveness/readiness evaluation
//! - `server` - axum routers for probes and metrics
//!
//! Construction validates the cache policy, connects to the cluster and binds
//! both listeners, so every environmental failure surfaces before any
//! reconciler is registered. Nothing runs until [`Manager::start`].

pub mod controller;
pub mod events;
pub mod health;
pub mod server;

pub use controller::{Action, Predicate, Reconcile, Registration};

use crate::cache::{
    operator_cache_policy, CachePolicy, CachePolicyError, InformerCache, WatchFailure,
};
use crate::client::{CachedClient, ClientError, ClusterApi, Connector};
use crate::constants::DEFAULT_SYNC_PERIOD_SECS;
use crate::observability::Metrics;
use crate::reconciler::SetupError;
use crate::runtime::lifecycle::{Lifecycle, Phase};
use crate::scheme::TypeRegistry;
use events::{EventRecorder, EventSink};
use health::{Checker, ProbeState};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot reach the cluster: {0}")]
    Connect(#[source] ClientError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    CachePolicy(#[from] CachePolicyError),

    #[error("health check '{0}' is already registered")]
    DuplicateCheck(String),

    #[error("{0} registration(s) were staged but never committed")]
    Uncommitted(usize),

    #[error("controller {controller} cannot use its informer: {source}")]
    Informer {
        controller: String,
        #[source]
        source: ClientError,
    },

    #[error("informer for {kind} stopped: {source}")]
    Watch {
        kind: String,
        #[source]
        source: ClientError,
    },

    #[error("HTTP server failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("runnable {name} failed: {reason}")]
    Runnable { name: String, reason: String },
}

/// Knobs for [`Manager::new`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub registry: Arc<TypeRegistry>,
    /// Informer full-resync period
    pub sync_period: Duration,
    pub cache_policy: CachePolicy,
    /// `None` disables the metrics listener
    pub metrics_bind_address: Option<SocketAddr>,
    pub health_probe_bind_address: SocketAddr,
    pub lifecycle: Arc<Lifecycle>,
    pub metrics: Arc<Metrics>,
}

impl ManagerOptions {
    pub fn new(registry: Arc<TypeRegistry>, lifecycle: Arc<Lifecycle>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            sync_period: Duration::from_secs(DEFAULT_SYNC_PERIOD_SECS),
            cache_policy: operator_cache_policy(),
            metrics_bind_address: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)),
            health_probe_bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8081),
            lifecycle,
            metrics,
        }
    }
}

pub struct Manager {
    registry: Arc<TypeRegistry>,
    cluster_config: kube::Config,
    cache: Arc<InformerCache>,
    client: Arc<CachedClient>,
    event_sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    probes: ProbeState,
    probe_listener: TcpListener,
    metrics_listener: Option<TcpListener>,
    staged: Vec<Registration>,
    registrations: Vec<Registration>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("kinds", &self.registry.len())
            .field("probes", &self.probes)
            .field("staged", &self.staged)
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

async fn next_failure(
    failures: &mut Option<mpsc::UnboundedReceiver<WatchFailure>>,
) -> Option<WatchFailure> {
    match failures {
        Some(failures) => failures.recv().await,
        None => None,
    }
}

async fn bind(address: SocketAddr) -> Result<TcpListener, ManagerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ManagerError::Bind { address, source })
}

impl Manager {
    /// Validate the cache policy, connect and bind the listeners
    pub async fn new(connector: &dyn Connector, options: ManagerOptions) -> Result<Self, ManagerError> {
        options.cache_policy.validate(&options.registry)?;

        let live = connector
            .connect(Arc::clone(&options.registry))
            .await
            .map_err(ManagerError::Connect)?;
        let event_sink = connector.event_sink().map_err(ManagerError::Connect)?;

        let probe_listener = bind(options.health_probe_bind_address).await?;
        let metrics_listener = match options.metrics_bind_address {
            Some(address) => Some(bind(address).await?),
            None => None,
        };

        let policy = Arc::new(options.cache_policy);
        let cache = Arc::new(InformerCache::new(
            Arc::clone(&live),
            Arc::clone(&policy),
            options.sync_period,
        ));
        let client = Arc::new(CachedClient::new(live, Arc::clone(&cache), Arc::clone(&policy)));

        info!(
            sync_period = ?options.sync_period,
            uncached = ?policy.uncached().map(|gvk| gvk.kind.as_str()).collect::<Vec<_>>(),
            "manager created"
        );

        Ok(Self {
            registry: options.registry,
            cluster_config: connector.config().clone(),
            cache,
            client,
            event_sink,
            metrics: options.metrics,
            probes: ProbeState::new(options.lifecycle),
            probe_listener,
            metrics_listener,
            staged: Vec::new(),
            registrations: Vec::new(),
        })
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Client reading from the cache, except for cache-excluded kinds
    pub fn client(&self) -> Arc<dyn ClusterApi> {
        Arc::clone(&self.client) as Arc<dyn ClusterApi>
    }

    pub fn cluster_config(&self) -> &kube::Config {
        &self.cluster_config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn event_recorder_for(&self, reporter: &str) -> EventRecorder {
        EventRecorder::new(reporter, Arc::clone(&self.event_sink))
    }

    /// Address the probe server is bound to
    pub fn health_probe_address(&self) -> Option<SocketAddr> {
        self.probe_listener.local_addr().ok()
    }

    pub fn metrics_address(&self) -> Option<SocketAddr> {
        self.metrics_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn add_healthz_check(&mut self, name: &str, check: Checker) -> Result<(), ManagerError> {
        if self.probes.has_check(name) {
            return Err(ManagerError::DuplicateCheck(name.to_string()));
        }
        self.probes.add_liveness(name, check);
        Ok(())
    }

    pub fn add_readyz_check(&mut self, name: &str, check: Checker) -> Result<(), ManagerError> {
        if self.probes.has_check(name) {
            return Err(ManagerError::DuplicateCheck(name.to_string()));
        }
        self.probes.add_readiness(name, check);
        Ok(())
    }

    /// Stage a controller; it only runs once [`Self::commit_registrations`] is called
    pub fn add(&mut self, registration: Registration) -> Result<(), SetupError> {
        let name = registration.name().to_string();
        if name.trim().is_empty() {
            return Err(SetupError::InvalidWatch {
                controller: name,
                reason: "controller name is empty".to_string(),
            });
        }
        if self
            .staged
            .iter()
            .chain(&self.registrations)
            .any(|existing| existing.name() == name)
        {
            return Err(SetupError::Duplicate(name));
        }
        if let Err(e) = self.registry.lookup(registration.kind()) {
            return Err(SetupError::InvalidWatch {
                controller: name,
                reason: e.to_string(),
            });
        }

        debug!(controller = %name, kind = %registration.kind().kind, "controller staged");
        self.staged.push(registration);
        Ok(())
    }

    /// Make every staged controller part of the run set
    pub fn commit_registrations(&mut self) -> usize {
        let committed = self.staged.len();
        self.registrations.append(&mut self.staged);
        committed
    }

    /// Names of the committed controllers
    pub fn registrations(&self) -> Vec<&str> {
        self.registrations.iter().map(Registration::name).collect()
    }

    /// Run servers, informers and controllers until `cancel` fires or one of them fails
    ///
    /// Returns `Ok(())` after a cancellation-driven shutdown; any runnable
    /// failure stops the rest and is returned. The HTTP servers stop last, so
    /// liveness keeps answering while controllers drain.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), ManagerError> {
        let Manager {
            cache,
            metrics,
            probes,
            probe_listener,
            metrics_listener,
            staged,
            registrations,
            ..
        } = self;

        if !staged.is_empty() {
            return Err(ManagerError::Uncommitted(staged.len()));
        }

        // a failing runnable stops its siblings without touching the caller's token
        let run = cancel.child_token();
        let serve = CancellationToken::new();
        let probes = Arc::new(probes);

        let mut servers = JoinSet::new();
        servers.spawn(server::serve(
            "probes",
            probe_listener,
            server::probe_router(Arc::clone(&probes)),
            serve.clone(),
        ));
        if let Some(listener) = metrics_listener {
            servers.spawn(server::serve(
                "metrics",
                listener,
                server::metrics_router(Arc::clone(&metrics)),
                serve.clone(),
            ));
        }

        let mut controllers = JoinSet::new();
        let mut names = HashSet::new();
        for registration in registrations {
            let informer = match cache.informer_for(registration.kind()) {
                Ok(informer) => informer,
                Err(source) => {
                    serve.cancel();
                    return Err(ManagerError::Informer {
                        controller: registration.name().to_string(),
                        source,
                    });
                }
            };
            names.insert(registration.name().to_string());
            controllers.spawn(controller::run(
                registration,
                informer,
                Arc::clone(&metrics),
                run.clone(),
            ));
        }
        let mut watch_failures = cache.take_failures();
        cache.start(run.clone());
        info!(controllers = ?names, "manager started");

        let outcome = loop {
            tokio::select! {
                () = run.cancelled() => break Ok(()),
                Some(failure) = next_failure(&mut watch_failures) => break Err(ManagerError::Watch {
                    kind: failure.kind,
                    source: failure.error,
                }),
                Some(joined) = controllers.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(ManagerError::Runnable {
                        name: "controller".to_string(),
                        reason: e.to_string(),
                    }),
                },
                Some(joined) = servers.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(ManagerError::Serve(e)),
                    Err(e) => break Err(ManagerError::Runnable {
                        name: "server".to_string(),
                        reason: e.to_string(),
                    }),
                },
            }
        };

        match &outcome {
            Ok(()) => {
                if let Err(e) = probes.lifecycle().advance(Phase::ShuttingDown) {
                    debug!(error = %e, "lifecycle not advanced to ShuttingDown");
                }
                info!("shutdown requested, draining controllers");
            }
            Err(e) => error!(error = %e, "runnable failed, stopping manager"),
        }

        run.cancel();
        while let Some(joined) = controllers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "controller failed during shutdown"),
                Err(e) => warn!(error = %e, "controller task aborted during shutdown"),
            }
        }
        cache.join().await;

        serve.cancel();
        while let Some(joined) = servers.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "HTTP server failed during shutdown");
            }
        }
        info!("manager stopped");
        outcome
    }
}
