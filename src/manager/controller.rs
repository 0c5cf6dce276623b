//! # Controller
//!
//! Every registration runs as a `kube_runtime::Controller` over the informer
//! of its primary kind. The informer's store is the controller's reader, and
//! its change broadcast, filtered by the registration's predicate, is the
//! trigger stream. Scheduling, de-duplication, requeues and graceful shutdown
//! belong to the runtime: a reconcile in flight always completes.
//!
//! A deleted object has left the store by the time its trigger is handled,
//! which the runtime reports as `ObjectNotFound`. The reconciler then gets
//! one call for the bare key so it can clean up after the object.

use super::ManagerError;
use crate::cache::{CacheEvent, Informer};
use crate::client::ObjectKey;
use crate::observability::Metrics;
use crate::reconciler::ReconcileError;
use async_trait::async_trait;
use futures::{future, stream, Stream, StreamExt};
use kube::core::{DynamicObject, GroupVersionKind};
use kube_runtime::controller::{self, Controller};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

pub use kube_runtime::controller::Action;

/// Per-object reconcile logic
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Delay before retrying a failed reconcile
    fn error_requeue(&self) -> Duration;
}

/// Filter applied to changes before they trigger a reconcile
pub type Predicate = Arc<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// A reconciler wired to the kind it watches
pub struct Registration {
    name: String,
    kind: GroupVersionKind,
    predicate: Predicate,
    reconciler: Arc<dyn Reconcile>,
    span: Span,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("kind", &self.kind.kind)
            .finish_non_exhaustive()
    }
}

impl Registration {
    pub fn new(name: &str, kind: GroupVersionKind, reconciler: Arc<dyn Reconcile>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            predicate: Arc::new(|_| true),
            reconciler,
            span: Span::none(),
        }
    }

    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&DynamicObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Span every reconcile of this controller runs in
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &GroupVersionKind {
        &self.kind
    }
}

/// Shared state handed to every reconcile of one controller
struct Context {
    name: String,
    reconciler: Arc<dyn Reconcile>,
    metrics: Arc<Metrics>,
    span: Span,
}

impl Context {
    async fn observe(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let started = Instant::now();
        let result = self
            .reconciler
            .reconcile(key)
            .instrument(self.span.clone())
            .await;
        self.metrics
            .observe_reconciliation(&self.name, started.elapsed().as_secs_f64(), result.is_err());
        result
    }

    async fn report(
        &self,
        result: Result<(ObjectRef<DynamicObject>, Action), controller::Error<ReconcileError, watcher::Error>>,
    ) {
        match result {
            Ok((object, action)) => {
                debug!(parent: &self.span, controller = %self.name, %object, ?action, "reconciled");
            }
            Err(controller::Error::ObjectNotFound(object)) => {
                let key = ObjectKey {
                    namespace: object.namespace.clone(),
                    name: object.name.clone(),
                };
                match self.observe(&key).await {
                    Ok(_) => debug!(parent: &self.span, controller = %self.name, object = %key, "reconciled deleted object"),
                    Err(e) => warn!(parent: &self.span, controller = %self.name, object = %key, error = %e, "cleanup after deletion failed"),
                }
            }
            // already logged by the error policy
            Err(controller::Error::ReconcilerFailed(_, _)) => {}
            Err(e) => warn!(parent: &self.span, controller = %self.name, error = %e, "controller error"),
        }
    }
}

async fn reconcile(object: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    match ObjectKey::of(&object) {
        Some(key) => ctx.observe(&key).await,
        None => Ok(Action::await_change()),
    }
}

fn error_policy(object: Arc<DynamicObject>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let delay = ctx.reconciler.error_requeue();
    error!(
        parent: &ctx.span,
        controller = %ctx.name,
        object = object.metadata.name.as_deref().unwrap_or_default(),
        error = %error,
        ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

/// Objects to reconcile: the synced store first, then every change
///
/// A receiver that lagged behind the cache replays the whole store.
fn triggers(
    informer: Arc<Informer>,
    events: broadcast::Receiver<CacheEvent>,
    predicate: Predicate,
) -> impl Stream<Item = Result<DynamicObject, watcher::Error>> + Send + 'static {
    let initial = stream::iter(informer.snapshot());
    let changes = stream::unfold((events, informer), |(mut events, informer)| async move {
        let objects = match events.recv().await {
            Ok(event) => vec![event.object],
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(kind = %informer.kind().kind, missed, "controller lagged behind the cache, requeueing everything");
                informer.snapshot()
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        Some((stream::iter(objects), (events, informer)))
    })
    .flatten();

    initial
        .chain(changes)
        .filter(move |object| future::ready(predicate(object.as_ref())))
        .map(|object| Ok(DynamicObject::clone(&object)))
}

/// Run one controller until `cancel` fires and its in-flight reconciles finish
pub(crate) async fn run(
    registration: Registration,
    informer: Arc<Informer>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<(), ManagerError> {
    let Registration {
        name,
        predicate,
        reconciler,
        span,
        ..
    } = registration;
    // subscribe before waiting so nothing announced at sync time is lost
    let events = informer.subscribe();

    tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        synced = informer.wait_synced() => synced.map_err(|source| ManagerError::Informer {
            controller: name.clone(),
            source,
        })?,
    }

    let ctx = Arc::new(Context {
        name,
        reconciler,
        metrics,
        span,
    });
    info!(parent: &ctx.span, controller = %ctx.name, "controller started");

    Controller::for_stream_with(
        triggers(Arc::clone(&informer), events, predicate),
        informer.store(),
        informer.kind().api_resource(),
    )
    .graceful_shutdown_on(cancel.cancelled_owned())
    .run(reconcile, error_policy, Arc::clone(&ctx))
    .for_each(|result| {
        let ctx = Arc::clone(&ctx);
        async move { ctx.report(result).await }
    })
    .await;

    info!(parent: &ctx.span, controller = %ctx.name, "controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{operator_cache_policy, InformerCache};
    use crate::client::fake::FakeCluster;
    use crate::client::{to_dynamic, ClientError, ClusterApi};
    use crate::scheme::kinds::{self, default_registry};
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every key it is asked to reconcile; fails the first `failures` calls
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        failures: AtomicUsize,
    }

    impl Recording {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }

        fn count(&self, name: &str) -> usize {
            self.seen().iter().filter(|n| *n == name).count()
        }
    }

    #[async_trait]
    impl Reconcile for Recording {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
            self.seen.lock().unwrap().push(key.name.clone());
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ClientError::Injected("reconcile failed".to_string()).into());
            }
            Ok(Action::await_change())
        }

        fn error_requeue(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    struct Running {
        cluster: FakeCluster,
        cache: Arc<InformerCache>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<(), ManagerError>>,
    }

    fn start(cluster: FakeCluster, registration: Registration) -> Running {
        let client = Arc::new(cluster.client(default_registry().unwrap()));
        let cache = Arc::new(InformerCache::new(
            client,
            Arc::new(operator_cache_policy()),
            Duration::from_secs(1800),
        ));
        let informer = cache.informer_for(registration.kind()).unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            registration,
            informer,
            Arc::clone(&metrics),
            cancel.clone(),
        ));
        cache.start(cancel.clone());
        Running {
            cluster,
            cache,
            metrics,
            cancel,
            handle,
        }
    }

    impl Running {
        async fn stop(self) {
            self.cancel.cancel();
            self.handle.await.unwrap().unwrap();
            self.cache.join().await;
        }
    }

    #[tokio::test]
    async fn test_changes_passing_the_predicate_are_reconciled() {
        let cluster = FakeCluster::new();
        cluster.seed(&namespace("team-a")).unwrap();
        cluster.seed(&namespace("kube-system")).unwrap();
        let recording = Arc::new(Recording::default());
        let registration = Registration::new(
            "namespace",
            kinds::gvk(kinds::namespace),
            Arc::clone(&recording) as Arc<dyn Reconcile>,
        )
        .with_predicate(|object| object.metadata.name.as_deref() != Some("kube-system"));
        let running = start(cluster, registration);

        // the synced store and the initial list may both trigger the first pass
        eventually("initial reconcile", || recording.count("team-a") >= 1).await;

        let gvk = kinds::gvk(kinds::namespace);
        let client = running.cluster.client(default_registry().unwrap());
        client
            .apply(&gvk, &to_dynamic(&namespace("team-b")).unwrap())
            .await
            .unwrap();
        eventually("new object reconciled", || recording.count("team-b") >= 1).await;

        // the deleted object is gone from the store; its key is reconciled once more
        let before = recording.count("team-a");
        client.delete(&gvk, &ObjectKey::cluster("team-a")).await.unwrap();
        eventually("deleted object reconciled", || recording.count("team-a") > before).await;

        assert_eq!(recording.count("kube-system"), 0);
        assert!(running.metrics.reconciliations("namespace") >= 3);
        running.stop().await;
    }

    #[tokio::test]
    async fn test_failed_reconcile_is_retried_by_error_policy() {
        let cluster = FakeCluster::new();
        cluster.seed(&namespace("team-a")).unwrap();
        let recording = Arc::new(Recording {
            failures: AtomicUsize::new(2),
            ..Recording::default()
        });
        let registration = Registration::new(
            "namespace",
            kinds::gvk(kinds::namespace),
            Arc::clone(&recording) as Arc<dyn Reconcile>,
        );
        let running = start(cluster, registration);

        eventually("retries after failures", || recording.count("team-a") >= 3).await;
        assert_eq!(running.metrics.reconciliation_errors("namespace"), 2);
        running.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_before_sync_returns_immediately() {
        let cluster = FakeCluster::new();
        let client = Arc::new(cluster.client(default_registry().unwrap()));
        let cache = InformerCache::new(
            client,
            Arc::new(operator_cache_policy()),
            Duration::from_secs(1800),
        );
        let gvk = kinds::gvk(kinds::namespace);
        let informer = cache.informer_for(&gvk).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let registration = Registration::new("namespace", gvk, Arc::new(Recording::default()));
        run(registration, informer, Arc::new(Metrics::new().unwrap()), cancel)
            .await
            .unwrap();
    }
}
