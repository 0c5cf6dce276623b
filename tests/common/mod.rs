//! Shared helpers for the startup integration tests.
//!
//! Every test runs the operator against an in-memory `FakeCluster`; probe
//! listeners bind to ephemeral loopback ports.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ObjectMeta;
use registry_operator::client::fake::FakeCluster;
use registry_operator::config::{DomainConfig, OperatorConfig, Settings};
use registry_operator::constants::DEPRECATED_GITREPOSITORY_CRD;
use registry_operator::crd::{DockerRegistry, DockerRegistrySpec};
use registry_operator::reconciler::{ChartError, ChartInstaller};
use registry_operator::runtime::{Lifecycle, Phase};
use registry_operator::scheme::kinds::default_registry;
use registry_operator::scheme::TypeRegistry;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Notify;

static RUSTLS_INIT: Once = Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        // another test may already have installed it
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub fn registry() -> Arc<TypeRegistry> {
    default_registry().expect("built-in kinds register cleanly")
}

/// A loopback address nothing listens on right now
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local address")
}

/// Settings with the probe listener on `probe` and metrics disabled
pub fn settings(probe: SocketAddr) -> Settings {
    Settings {
        operator: OperatorConfig::default(),
        domain: DomainConfig::default(),
        metrics_bind_address: None,
        health_probe_bind_address: probe,
    }
}

pub fn orphan_crd() -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(DEPRECATED_GITREPOSITORY_CRD.to_string()),
            ..ObjectMeta::default()
        },
        ..CustomResourceDefinition::default()
    }
}

/// Chart installer that applies nothing
#[derive(Debug, Default)]
pub struct NoopChart;

#[async_trait]
impl ChartInstaller for NoopChart {
    async fn install(&self, _registry: &DockerRegistry) -> Result<usize, ChartError> {
        Ok(0)
    }
}

/// Chart installer that holds every install for `delay`
#[derive(Debug)]
pub struct SlowChart {
    delay: Duration,
    started: Notify,
    finished: AtomicUsize,
}

impl SlowChart {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Notify::new(),
            finished: AtomicUsize::new(0),
        }
    }

    /// Wait until an install is in flight
    pub async fn wait_started(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.started.notified())
            .await
            .expect("install started in time");
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChartInstaller for SlowChart {
    async fn install(&self, _registry: &DockerRegistry) -> Result<usize, ChartError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

pub fn docker_registry(namespace: &str, name: &str) -> DockerRegistry {
    let mut registry = DockerRegistry::new(name, DockerRegistrySpec::default());
    registry.metadata.namespace = Some(namespace.to_string());
    registry.metadata.generation = Some(1);
    registry
}

pub fn cluster() -> FakeCluster {
    init_rustls();
    FakeCluster::new()
}

/// Block until the lifecycle reaches `phase` (or a later one)
pub async fn wait_for_phase(lifecycle: &Lifecycle, phase: Phase) -> Phase {
    let mut phases = lifecycle.subscribe();
    let reached = tokio::time::timeout(Duration::from_secs(10), phases.wait_for(|p| *p >= phase))
        .await
        .expect("phase reached in time")
        .expect("lifecycle still alive");
    *reached
}

pub async fn probe(address: SocketAddr, path: &str) -> reqwest::Result<reqwest::StatusCode> {
    let response = reqwest::Client::new()
        .get(format!("http://{address}{path}"))
        .timeout(Duration::from_secs(5))
        .send()
        .await?;
    Ok(response.status())
}
