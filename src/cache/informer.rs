//! # Informer Cache
//!
//! One [`Informer`] per cached kind: a `kube_runtime` reflector store fed by
//! [`ClusterApi::watch`], plus a broadcast of changes for the controllers
//! watching that kind.
//!
//! Kinds the cache policy excludes still get an informer when a controller
//! watches them, but it keeps object metadata only: payloads such as secret
//! data never enter the store.
//!
//! Each informer re-opens its watch every `sync_period`. The fresh initial
//! list rebuilds the store and re-announces every object, which heals
//! anything a dropped watch missed.
//!
//! A stream error restarts the watch after a delay. A watch that cannot be
//! opened at all ends the informer and is reported as a [`WatchFailure`].

use super::CachePolicy;
use crate::client::{ClientError, ClusterApi, ObjectKey};
use crate::constants::{CACHE_EVENT_BUFFER, DEFAULT_WATCH_RESTART_DELAY_SECS};
use crate::scheme::{display_gvk, ObjectKind};
use futures::StreamExt;
use kube::core::{DynamicObject, GroupVersionKind};
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher::Event;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Change notification delivered to controllers
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub object: Arc<DynamicObject>,
    pub deleted: bool,
}

/// An informer that stopped because its watch could not be opened
#[derive(Debug)]
pub struct WatchFailure {
    pub kind: String,
    pub error: ClientError,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Watch-backed store for one kind
pub struct Informer {
    kind: ObjectKind,
    metadata_only: bool,
    store: Store<DynamicObject>,
    writer: Mutex<Option<Writer<DynamicObject>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl fmt::Debug for Informer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Informer")
            .field("kind", &self.kind.kind)
            .field("metadata_only", &self.metadata_only)
            .field("objects", &self.store.state().len())
            .field("running", &lock(&self.writer).is_none())
            .finish()
    }
}

impl Informer {
    fn new(kind: ObjectKind, metadata_only: bool) -> Self {
        let writer = Writer::new(kind.api_resource());
        let store = writer.as_reader();
        let (events, _) = broadcast::channel(CACHE_EVENT_BUFFER);
        Self {
            kind,
            metadata_only,
            store,
            writer: Mutex::new(Some(writer)),
            events,
        }
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Receive changes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Wait for the first complete list
    pub async fn wait_synced(&self) -> Result<(), ClientError> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|e| ClientError::Watch(e.to_string()))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<DynamicObject> {
        let mut reference = ObjectRef::new_with(&key.name, self.kind.api_resource());
        if let Some(ns) = &key.namespace {
            reference = reference.within(ns);
        }
        self.store.get(&reference).map(|o| (*o).clone())
    }

    pub fn list(&self, namespace: Option<&str>) -> Vec<DynamicObject> {
        self.store
            .state()
            .into_iter()
            .filter(|o| namespace.is_none() || o.metadata.namespace.as_deref() == namespace)
            .map(|o| (*o).clone())
            .collect()
    }

    /// Snapshot of every cached object
    pub fn snapshot(&self) -> Vec<Arc<DynamicObject>> {
        self.store.state()
    }

    /// Reader over the store, shared with the controllers of this kind
    pub fn store(&self) -> Store<DynamicObject> {
        self.store.clone()
    }

    fn spawn(
        self: &Arc<Self>,
        source: Arc<dyn ClusterApi>,
        sync_period: Duration,
        cancel: CancellationToken,
        failures: mpsc::UnboundedSender<WatchFailure>,
    ) -> Option<JoinHandle<()>> {
        let writer = lock(&self.writer).take()?;
        let informer = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(error) = informer.run(writer, source.as_ref(), sync_period, &cancel).await {
                // the receiver is gone once the manager stopped
                let _ = failures.send(WatchFailure {
                    kind: informer.kind.kind.clone(),
                    error,
                });
            }
        }))
    }

    async fn run(
        &self,
        mut writer: Writer<DynamicObject>,
        source: &dyn ClusterApi,
        sync_period: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let gvk = self.kind.gvk();
        let restart_delay = Duration::from_secs(DEFAULT_WATCH_RESTART_DELAY_SECS);
        debug!(kind = %self.kind.kind, "informer started");

        loop {
            let mut stream = match source.watch(&gvk) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(kind = %self.kind.kind, error = %e, "informer cannot watch kind");
                    return Err(e);
                }
            };
            let resync = tokio::time::sleep(sync_period);
            tokio::pin!(resync);
            // initial list notifications are held back until the store has swapped in
            let mut pending: Vec<CacheEvent> = Vec::new();

            let delay = loop {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = &mut resync => {
                        debug!(kind = %self.kind.kind, "periodic resync");
                        break Duration::ZERO;
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            let event = if self.metadata_only { strip_payload(event) } else { event };
                            self.apply(&mut writer, &event, &mut pending);
                        }
                        Some(Err(e)) => {
                            warn!(kind = %self.kind.kind, error = %e, "watch failed, restarting");
                            break restart_delay;
                        }
                        None => break restart_delay,
                    }
                }
            };

            if !delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    fn apply(
        &self,
        writer: &mut Writer<DynamicObject>,
        event: &Event<DynamicObject>,
        pending: &mut Vec<CacheEvent>,
    ) {
        writer.apply_watcher_event(event);
        match event {
            Event::Init => pending.clear(),
            Event::InitApply(object) => pending.push(CacheEvent {
                object: Arc::new(object.clone()),
                deleted: false,
            }),
            Event::InitDone => {
                debug!(kind = %self.kind.kind, objects = pending.len(), "cache synced");
                for notification in pending.drain(..) {
                    self.notify(notification);
                }
            }
            Event::Apply(object) => self.notify(CacheEvent {
                object: Arc::new(object.clone()),
                deleted: false,
            }),
            Event::Delete(object) => self.notify(CacheEvent {
                object: Arc::new(object.clone()),
                deleted: true,
            }),
        }
    }

    fn notify(&self, event: CacheEvent) {
        // nobody listening is fine; reads go through the store
        let _ = self.events.send(event);
    }
}

fn strip_payload(event: Event<DynamicObject>) -> Event<DynamicObject> {
    let strip = |mut object: DynamicObject| {
        object.data = serde_json::Value::Object(serde_json::Map::new());
        object
    };
    match event {
        Event::Apply(object) => Event::Apply(strip(object)),
        Event::Delete(object) => Event::Delete(strip(object)),
        Event::InitApply(object) => Event::InitApply(strip(object)),
        Event::Init => Event::Init,
        Event::InitDone => Event::InitDone,
    }
}

/// Informers shared by the cached client and every controller
pub struct InformerCache {
    source: Arc<dyn ClusterApi>,
    policy: Arc<CachePolicy>,
    sync_period: Duration,
    informers: Mutex<HashMap<GroupVersionKind, Arc<Informer>>>,
    running: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    failures: mpsc::UnboundedSender<WatchFailure>,
    failed: Mutex<Option<mpsc::UnboundedReceiver<WatchFailure>>>,
}

impl fmt::Debug for InformerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InformerCache")
            .field("sync_period", &self.sync_period)
            .field("informers", &lock(&self.informers).len())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl InformerCache {
    pub fn new(source: Arc<dyn ClusterApi>, policy: Arc<CachePolicy>, sync_period: Duration) -> Self {
        let (failures, failed) = mpsc::unbounded_channel();
        Self {
            source,
            policy,
            sync_period,
            informers: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            failures,
            failed: Mutex::new(Some(failed)),
        }
    }

    /// Receiver of informer failures; only the first caller gets it
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<WatchFailure>> {
        lock(&self.failed).take()
    }

    /// Get or create the informer for `gvk`
    ///
    /// Informers created after [`Self::start`] begin watching immediately.
    pub fn informer_for(&self, gvk: &GroupVersionKind) -> Result<Arc<Informer>, ClientError> {
        let kind = self.source.registry().lookup(gvk)?;
        let metadata_only = !self.policy.is_cached(gvk);
        let informer = {
            let mut informers = lock(&self.informers);
            Arc::clone(
                informers
                    .entry(gvk.clone())
                    .or_insert_with(|| Arc::new(Informer::new(kind.clone(), metadata_only))),
            )
        };

        if let Some(cancel) = lock(&self.running).clone() {
            self.launch(&informer, cancel);
        }
        Ok(informer)
    }

    /// Start every informer; later calls are no-ops
    pub fn start(&self, cancel: CancellationToken) {
        {
            let mut running = lock(&self.running);
            if running.is_some() {
                return;
            }
            *running = Some(cancel.clone());
        }

        let informers: Vec<Arc<Informer>> = lock(&self.informers).values().cloned().collect();
        info!(informers = informers.len(), "starting informer cache");
        for informer in &informers {
            self.launch(informer, cancel.clone());
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.running).is_some()
    }

    fn launch(&self, informer: &Arc<Informer>, cancel: CancellationToken) {
        if let Some(handle) = informer.spawn(
            Arc::clone(&self.source),
            self.sync_period,
            cancel,
            self.failures.clone(),
        ) {
            lock(&self.tasks).push(handle);
        }
    }

    async fn synced_informer(&self, gvk: &GroupVersionKind) -> Result<Arc<Informer>, ClientError> {
        if !self.is_started() {
            return Err(ClientError::CacheNotStarted {
                kind: display_gvk(gvk),
            });
        }
        let informer = self.informer_for(gvk)?;
        informer.wait_synced().await?;
        Ok(informer)
    }

    /// Read one object from the cache, waiting for the first sync
    pub async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError> {
        let informer = self.synced_informer(gvk).await?;
        if informer.kind().is_namespaced() && key.namespace.is_none() {
            return Err(ClientError::namespace_required(gvk));
        }
        Ok(informer.get(key))
    }

    pub async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        Ok(self.synced_informer(gvk).await?.list(namespace))
    }

    /// Wait until every informer finished its first list
    pub async fn wait_for_sync(&self) -> Result<(), ClientError> {
        let informers: Vec<Arc<Informer>> = lock(&self.informers).values().cloned().collect();
        for informer in informers {
            informer.wait_synced().await?;
        }
        Ok(())
    }

    /// Wait for every informer task to observe cancellation
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "informer task failed");
            }
        }
    }
}
