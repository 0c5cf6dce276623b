//! Live client backed by `kube::Client`.

use super::{ClientError, ClusterApi, Connector, ObjectKey, WatchStream};
use crate::constants::OPERATOR_NAME;
use crate::manager::events::{EventSink, KubeEventSink};
use crate::scheme::{ObjectKind, Scope, TypeRegistry};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use kube::Client;
use kube_runtime::watcher;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// [`ClusterApi`] over a live API server connection
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
    registry: Arc<TypeRegistry>,
    field_manager: String,
}

impl fmt::Debug for KubeApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeApi")
            .field("kinds", &self.registry.len())
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl KubeApi {
    pub fn new(client: Client, registry: Arc<TypeRegistry>) -> Self {
        Self {
            client,
            registry,
            field_manager: OPERATOR_NAME.to_string(),
        }
    }

    fn resolve(&self, gvk: &GroupVersionKind) -> Result<&ObjectKind, ClientError> {
        Ok(self.registry.lookup(gvk)?)
    }

    /// Api handle for one kind, scoped to `namespace` when the kind is namespaced
    fn api(&self, kind: &ObjectKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match (kind.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    /// Api handle for a single object; namespaced kinds need the key's namespace
    fn object_api(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<Api<DynamicObject>, ClientError> {
        let kind = self.resolve(gvk)?;
        if kind.is_namespaced() && key.namespace.is_none() {
            return Err(ClientError::namespace_required(gvk));
        }
        Ok(self.api(kind, key.namespace.as_deref()))
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError> {
        let api = self.object_api(gvk, key)?;
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let kind = self.resolve(gvk)?;
        let list = self.api(kind, namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let kind = self.resolve(gvk)?;
        let key = ObjectKey::of(object).ok_or(ClientError::Incomplete("metadata.name"))?;
        if kind.is_namespaced() && key.namespace.is_none() {
            return Err(ClientError::namespace_required(gvk));
        }

        // server-side apply needs apiVersion/kind in the body
        let mut object = object.clone();
        object.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
        });

        let params = PatchParams::apply(&self.field_manager).force();
        let applied = self
            .api(kind, key.namespace.as_deref())
            .patch(&key.name, &params, &Patch::Apply(&object))
            .await?;
        debug!(kind = %kind.kind, object = %key, "applied");
        Ok(applied)
    }

    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<(), ClientError> {
        let api = self.object_api(gvk, key)?;
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<bool, ClientError> {
        let api = self.object_api(gvk, key)?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn watch(&self, gvk: &GroupVersionKind) -> Result<WatchStream, ClientError> {
        let kind = self.resolve(gvk)?;
        let api = self.api(kind, None);
        Ok(watcher(api, watcher::Config::default())
            .map_err(|e| ClientError::Watch(e.to_string()))
            .boxed())
    }
}

/// Connector for a real cluster
#[derive(Clone)]
pub struct KubeConnector {
    config: kube::Config,
}

impl fmt::Debug for KubeConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeConnector")
            .field("cluster_url", &self.config.cluster_url.to_string())
            .finish_non_exhaustive()
    }
}

impl KubeConnector {
    pub fn new(config: kube::Config) -> Self {
        Self { config }
    }

    /// Resolve the connection from in-cluster env or the local kubeconfig
    pub async fn infer() -> Result<Self, ClientError> {
        let config = kube::Config::infer()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(Self::new(config))
    }

    fn client(&self) -> Result<Client, ClientError> {
        Client::try_from(self.config.clone()).map_err(|e| ClientError::Connect(e.to_string()))
    }
}

#[async_trait]
impl Connector for KubeConnector {
    fn config(&self) -> &kube::Config {
        &self.config
    }

    async fn connect(
        &self,
        registry: Arc<TypeRegistry>,
    ) -> Result<Arc<dyn ClusterApi>, ClientError> {
        let client = self.client()?;
        // a version probe surfaces unreachable or unauthorized clusters up front
        let version = client
            .apiserver_version()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        debug!(version = %version.git_version, "connected to API server");
        Ok(Arc::new(KubeApi::new(client, registry)))
    }

    fn event_sink(&self) -> Result<Arc<dyn EventSink>, ClientError> {
        Ok(Arc::new(KubeEventSink::new(self.client()?)))
    }
}

