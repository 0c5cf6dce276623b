//! # In-memory cluster
//!
//! A small stand-in for the API server: objects live in a map, every change
//! is broadcast to open watches, and every call is recorded so tests can
//! assert on ordering. Failures, latency and an unreachable API server can be
//! injected per verb and kind.

use super::{gvk_of, ClientError, ClusterApi, Connector, ObjectKey, WatchStream};
use crate::manager::events::{EventSink, MemoryEventSink};
use crate::scheme::{ObjectKind, TypeRegistry};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use kube::error::ErrorResponse;
use kube_runtime::watcher::Event;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Client operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Apply,
    PatchStatus,
    Delete,
    Watch,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Apply => "apply",
            Verb::PatchStatus => "patch-status",
            Verb::Delete => "delete",
            Verb::Watch => "watch",
        };
        f.write_str(s)
    }
}

type StoreKey = (String, String, String, Option<String>, String);

fn store_key(gvk: &GroupVersionKind, key: &ObjectKey) -> StoreKey {
    (
        gvk.group.clone(),
        gvk.version.clone(),
        gvk.kind.clone(),
        key.namespace.clone(),
        key.name.clone(),
    )
}

fn same_kind(store_key: &StoreKey, gvk: &GroupVersionKind) -> bool {
    store_key.0 == gvk.group && store_key.1 == gvk.version && store_key.2 == gvk.kind
}

#[derive(Debug, Clone)]
struct Change {
    gvk: GroupVersionKind,
    object: DynamicObject,
    deleted: bool,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    ops: Vec<String>,
    failures: HashMap<(Verb, String), String>,
    refused_watches: HashSet<String>,
    unreachable: bool,
    latency: Duration,
    resource_version: u64,
}

/// Shared handle to one in-memory cluster
#[derive(Debug, Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<Change>,
    events: Arc<MemoryEventSink>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
            events: Arc::new(MemoryEventSink::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector handing out clients to this cluster
    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            cluster: self.clone(),
            config: kube::Config::new("https://fake-cluster.invalid".parse().unwrap_or_default()),
        }
    }

    /// Client bound to `registry`, bypassing connection checks
    pub fn client(&self, registry: Arc<TypeRegistry>) -> FakeClient {
        FakeClient {
            cluster: self.clone(),
            registry,
        }
    }

    /// Store a typed resource as-is, without recording an operation
    pub fn seed<K: Serialize>(&self, resource: &K) -> Result<DynamicObject, ClientError> {
        let object = super::to_dynamic(resource)?;
        let types = object
            .types
            .as_ref()
            .ok_or(ClientError::Incomplete("apiVersion/kind"))?;
        let gvk = gvk_of(types);
        let key = ObjectKey::of(&object).ok_or(ClientError::Incomplete("metadata.name"))?;
        Ok(self.store(&gvk, &key, object))
    }

    pub fn object(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(&store_key(gvk, key)).cloned()
    }

    pub fn objects(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| same_kind(k, gvk))
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Every call made so far, e.g. `"delete CustomResourceDefinition/foo"`
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Make every `verb` on `kind` fail with `message`
    pub fn fail(&self, verb: Verb, kind: &str, message: &str) {
        self.lock()
            .failures
            .insert((verb, kind.to_string()), message.to_string());
    }

    /// Make opening a watch on `kind` fail outright instead of through the stream
    pub fn refuse_watch(&self, kind: &str) {
        self.lock().refused_watches.insert(kind.to_string());
    }

    /// Events published through connectors of this cluster
    pub fn recorded_events(&self) -> Arc<MemoryEventSink> {
        Arc::clone(&self.events)
    }

    async fn call(&self, verb: Verb, kind: &str, detail: Option<&ObjectKey>) -> Result<(), ClientError> {
        let (latency, outcome) = {
            let mut state = self.lock();
            let op = match detail {
                Some(key) => format!("{verb} {kind}/{key}"),
                None => format!("{verb} {kind}"),
            };
            state.ops.push(op);
            let outcome = if state.unreachable {
                Err(ClientError::Connect("connection refused".to_string()))
            } else if let Some(message) = state.failures.get(&(verb, kind.to_string())) {
                Err(ClientError::Injected(message.clone()))
            } else {
                Ok(())
            };
            (state.latency, outcome)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        outcome
    }

    fn store(&self, gvk: &GroupVersionKind, key: &ObjectKey, mut object: DynamicObject) -> DynamicObject {
        let mut state = self.lock();
        state.resource_version += 1;
        let previous = state.objects.get(&store_key(gvk, key));

        object.metadata.resource_version = Some(state.resource_version.to_string());
        object.metadata.uid = previous
            .and_then(|p| p.metadata.uid.clone())
            .or(object.metadata.uid)
            .or_else(|| Some(format!("uid-{}", state.resource_version)));
        if object.data.get("status").is_none() {
            if let Some(status) = previous.and_then(|p| p.data.get("status")).cloned() {
                object.data["status"] = status;
            }
        }

        state.objects.insert(store_key(gvk, key), object.clone());
        drop(state);

        // no open watch is fine
        let _ = self.changes.send(Change {
            gvk: gvk.clone(),
            object: object.clone(),
            deleted: false,
        });
        object
    }

    fn remove(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Option<DynamicObject> {
        let removed = self.lock().objects.remove(&store_key(gvk, key))?;
        let _ = self.changes.send(Change {
            gvk: gvk.clone(),
            object: removed.clone(),
            deleted: true,
        });
        Some(removed)
    }
}

fn not_found(kind: &ObjectKind, key: &ObjectKey) -> ClientError {
    ClientError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} \"{}\" not found", kind.plural, key.name),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

/// [`ClusterApi`] over a [`FakeCluster`]
#[derive(Debug, Clone)]
pub struct FakeClient {
    cluster: FakeCluster,
    registry: Arc<TypeRegistry>,
}

impl FakeClient {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<&ObjectKind, ClientError> {
        Ok(self.registry.lookup(gvk)?)
    }

    fn check_scope(gvk: &GroupVersionKind, kind: &ObjectKind, key: &ObjectKey) -> Result<(), ClientError> {
        if kind.is_namespaced() && key.namespace.is_none() {
            return Err(ClientError::namespace_required(gvk));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeClient {
    fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError> {
        let kind = self.resolve(gvk)?;
        Self::check_scope(gvk, kind, key)?;
        self.cluster.call(Verb::Get, &kind.kind, Some(key)).await?;
        Ok(self.cluster.object(gvk, key))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let kind = self.resolve(gvk)?;
        self.cluster.call(Verb::List, &kind.kind, None).await?;
        let mut objects = self.cluster.objects(gvk);
        if let (Some(ns), true) = (namespace, kind.is_namespaced()) {
            objects.retain(|o| o.metadata.namespace.as_deref() == Some(ns));
        }
        Ok(objects)
    }

    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let kind = self.resolve(gvk)?;
        let key = ObjectKey::of(object).ok_or(ClientError::Incomplete("metadata.name"))?;
        Self::check_scope(gvk, kind, &key)?;
        self.cluster.call(Verb::Apply, &kind.kind, Some(&key)).await?;

        let mut object = object.clone();
        object.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
        });
        if !kind.is_namespaced() {
            object.metadata.namespace = None;
        }
        Ok(self.cluster.store(gvk, &key, object))
    }

    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<(), ClientError> {
        let kind = self.resolve(gvk)?;
        Self::check_scope(gvk, kind, key)?;
        self.cluster.call(Verb::PatchStatus, &kind.kind, Some(key)).await?;
        let mut object = self
            .cluster
            .object(gvk, key)
            .ok_or_else(|| not_found(kind, key))?;
        object.data["status"] = status;
        self.cluster.store(gvk, key, object);
        Ok(())
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<bool, ClientError> {
        let kind = self.resolve(gvk)?;
        Self::check_scope(gvk, kind, key)?;
        self.cluster.call(Verb::Delete, &kind.kind, Some(key)).await?;
        Ok(self.cluster.remove(gvk, key).is_some())
    }

    fn watch(&self, gvk: &GroupVersionKind) -> Result<WatchStream, ClientError> {
        let kind = self.resolve(gvk)?;
        if self.cluster.lock().refused_watches.contains(&kind.kind) {
            return Err(ClientError::Watch(format!("watch on {} refused", kind.kind)));
        }
        let state = WatchState {
            cluster: self.cluster.clone(),
            gvk: gvk.clone(),
            kind: kind.kind.clone(),
            // subscribe before the snapshot so no change falls in between
            changes: self.cluster.changes.subscribe(),
            backlog: None,
            done: false,
        };
        Ok(stream::unfold(state, WatchState::next).boxed())
    }
}

struct WatchState {
    cluster: FakeCluster,
    gvk: GroupVersionKind,
    kind: String,
    changes: broadcast::Receiver<Change>,
    backlog: Option<VecDeque<Event<DynamicObject>>>,
    done: bool,
}

impl WatchState {
    async fn next(mut self) -> Option<(Result<Event<DynamicObject>, ClientError>, Self)> {
        if self.done {
            return None;
        }
        if self.backlog.is_none() {
            if let Err(e) = self.cluster.call(Verb::Watch, &self.kind, None).await {
                self.done = true;
                return Some((Err(e), self));
            }
            let mut backlog = VecDeque::from([Event::Init]);
            backlog.extend(self.cluster.objects(&self.gvk).into_iter().map(Event::InitApply));
            backlog.push_back(Event::InitDone);
            self.backlog = Some(backlog);
        }
        if let Some(event) = self.backlog.as_mut().and_then(VecDeque::pop_front) {
            return Some((Ok(event), self));
        }

        loop {
            match self.changes.recv().await {
                Ok(change) if change.gvk == self.gvk => {
                    let event = if change.deleted {
                        Event::Delete(change.object)
                    } else {
                        Event::Apply(change.object)
                    };
                    return Some((Ok(event), self));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// [`Connector`] over a [`FakeCluster`]; fails like a real one when the
/// cluster is marked unreachable
#[derive(Debug, Clone)]
pub struct FakeConnector {
    cluster: FakeCluster,
    config: kube::Config,
}

impl FakeConnector {
    pub fn cluster(&self) -> &FakeCluster {
        &self.cluster
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn config(&self) -> &kube::Config {
        &self.config
    }

    async fn connect(
        &self,
        registry: Arc<TypeRegistry>,
    ) -> Result<Arc<dyn ClusterApi>, ClientError> {
        let unreachable = {
            let mut state = self.cluster.lock();
            state.ops.push("connect".to_string());
            state.unreachable
        };
        if unreachable {
            return Err(ClientError::Connect("dial tcp: connection refused".to_string()));
        }
        Ok(Arc::new(self.cluster.client(registry)))
    }

    fn event_sink(&self) -> Result<Arc<dyn EventSink>, ClientError> {
        Ok(self.cluster.recorded_events())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::kinds::{self, default_registry};
    use futures::TryStreamExt;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use kube::api::ObjectMeta;

    fn config_map(ns: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_get_list_delete() {
        let cluster = FakeCluster::new();
        cluster.seed(&config_map("a", "one")).unwrap();
        cluster.seed(&config_map("b", "two")).unwrap();
        let client = cluster.client(default_registry().unwrap());
        let gvk = kinds::gvk(kinds::config_map);

        assert_eq!(client.list(&gvk, None).await.unwrap().len(), 2);
        assert_eq!(client.list(&gvk, Some("a")).await.unwrap().len(), 1);

        let key = ObjectKey::namespaced("a", "one");
        assert!(client.get(&gvk, &key).await.unwrap().is_some());
        assert!(client.delete(&gvk, &key).await.unwrap());
        assert!(!client.delete(&gvk, &key).await.unwrap());
        assert!(client.get(&gvk, &key).await.unwrap().is_none());

        assert_eq!(
            cluster.ops(),
            vec![
                "list ConfigMap",
                "list ConfigMap",
                "get ConfigMap/a/one",
                "delete ConfigMap/a/one",
                "delete ConfigMap/a/one",
                "get ConfigMap/a/one",
            ]
        );
    }

    #[tokio::test]
    async fn test_namespaced_kind_requires_namespace() {
        let cluster = FakeCluster::new();
        let client = cluster.client(default_registry().unwrap());
        let err = client
            .get(&kinds::gvk(kinds::secret), &ObjectKey::cluster("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NamespaceRequired { .. }));
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_rejected() {
        let cluster = FakeCluster::new();
        let client = cluster.client(crate::scheme::TypeRegistryBuilder::new().build());
        let err = client
            .list(&kinds::gvk(kinds::namespace), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnregisteredKind(_)));
        assert!(cluster.ops().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cluster = FakeCluster::new();
        let client = cluster.client(default_registry().unwrap());
        cluster.fail(Verb::List, "Namespace", "etcd is sad");
        let err = client
            .list(&kinds::gvk(kinds::namespace), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Injected(m) if m == "etcd is sad"));

        cluster.set_unreachable(true);
        let err = cluster.connector().connect(default_registry().unwrap()).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
    }

    #[tokio::test]
    async fn test_patch_status_on_missing_object_is_not_found() {
        let cluster = FakeCluster::new();
        let client = cluster.client(default_registry().unwrap());
        let err = client
            .patch_status(
                &kinds::gvk(kinds::docker_registry),
                &ObjectKey::namespaced("kyma-system", "default"),
                serde_json::json!({"state": "Ready"}),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_watch_replays_state_then_streams_changes() {
        let cluster = FakeCluster::new();
        let registry = default_registry().unwrap();
        let client = cluster.client(Arc::clone(&registry));
        let gvk = kinds::gvk(kinds::namespace);
        cluster
            .seed(&Namespace {
                metadata: ObjectMeta {
                    name: Some("existing".to_string()),
                    ..ObjectMeta::default()
                },
                ..Namespace::default()
            })
            .unwrap();

        let mut watch = client.watch(&gvk).unwrap();
        assert!(matches!(watch.try_next().await.unwrap(), Some(Event::Init)));
        assert!(matches!(watch.try_next().await.unwrap(), Some(Event::InitApply(_))));
        assert!(matches!(watch.try_next().await.unwrap(), Some(Event::InitDone)));

        let created = super::super::to_dynamic(&Namespace {
            metadata: ObjectMeta {
                name: Some("fresh".to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        })
        .unwrap();
        client.apply(&gvk, &created).await.unwrap();
        match watch.try_next().await.unwrap() {
            Some(Event::Apply(obj)) => assert_eq!(obj.metadata.name.as_deref(), Some("fresh")),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
