//! # Cluster Clients
//!
//! Every component talks to the API server through [`ClusterApi`], a
//! kind-addressed client over `DynamicObject`s. Kinds are resolved through the
//! shared [`TypeRegistry`], so a request for an unregistered kind fails with
//! [`ClientError::UnregisteredKind`] before anything goes on the wire.
//!
//! - `live` - [`KubeApi`] backed by a `kube::Client`, and the [`KubeConnector`]
//! - `cached` - [`CachedClient`], the Manager's read-from-cache client
//! - `fake` - in-memory cluster used by tests and local runs

mod cached;
pub mod fake;
mod live;

pub use cached::CachedClient;
pub use live::{KubeApi, KubeConnector};

use crate::manager::events::EventSink;
use crate::scheme::{display_gvk, TypeRegistry, UnregisteredKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Namespace and name of one object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Key of an existing object; `None` when the object carries no name
    pub fn of(object: &DynamicObject) -> Option<Self> {
        Some(Self {
            namespace: object.metadata.namespace.clone(),
            name: object.metadata.name.clone()?,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    UnregisteredKind(#[from] UnregisteredKind),

    #[error("failed to connect to the cluster: {0}")]
    Connect(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} is namespaced; a namespace is required")]
    NamespaceRequired { kind: String },

    #[error("object is missing {0}")]
    Incomplete(&'static str),

    #[error("failed to convert object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("cache for {kind} is not started")]
    CacheNotStarted { kind: String },

    #[error("simulated API failure: {0}")]
    Injected(String),
}

impl ClientError {
    pub fn namespace_required(gvk: &GroupVersionKind) -> Self {
        Self::NamespaceRequired {
            kind: display_gvk(gvk),
        }
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

/// Watch events for one kind, as produced by `kube_runtime::watcher`
pub type WatchStream = BoxStream<'static, Result<watcher::Event<DynamicObject>, ClientError>>;

/// Kind-addressed access to the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync + fmt::Debug {
    /// Registry every request is resolved against
    fn registry(&self) -> &Arc<TypeRegistry>;

    /// Fetch one object; `Ok(None)` when it does not exist
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError>;

    /// List objects of a kind, optionally within one namespace
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError>;

    /// Server-side apply the object under the operator's field manager
    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Replace the status subresource
    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<(), ClientError>;

    /// Delete an object; `Ok(false)` when it was already gone
    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<bool, ClientError>;

    /// Start a list+watch stream for a kind across all namespaces
    fn watch(&self, gvk: &GroupVersionKind) -> Result<WatchStream, ClientError>;
}

/// Builds cluster handles from one connection configuration
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connection configuration handed to reconcilers
    fn config(&self) -> &kube::Config;

    /// Open a new handle; fails when the API server is unreachable
    async fn connect(&self, registry: Arc<TypeRegistry>)
        -> Result<Arc<dyn ClusterApi>, ClientError>;

    /// Sink for Kubernetes events published by reconcilers
    fn event_sink(&self) -> Result<Arc<dyn EventSink>, ClientError>;
}

/// Split `group/version` (or bare `version` for the core group)
pub fn gvk_of(types: &TypeMeta) -> GroupVersionKind {
    match types.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &types.kind),
        None => GroupVersionKind::gvk("", &types.api_version, &types.kind),
    }
}

/// Convert a typed resource into a `DynamicObject`
pub fn to_dynamic<K: Serialize>(resource: &K) -> Result<DynamicObject, ClientError> {
    Ok(serde_json::from_value(serde_json::to_value(resource)?)?)
}

/// Convert a `DynamicObject` into a typed resource
pub fn from_dynamic<K: DeserializeOwned>(object: DynamicObject) -> Result<K, ClientError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    #[test]
    fn test_gvk_of_core_and_grouped_kinds() {
        let core = TypeMeta {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
        };
        assert_eq!(gvk_of(&core), GroupVersionKind::gvk("", "v1", "Secret"));

        let grouped = TypeMeta {
            api_version: "networking.istio.io/v1beta1".to_string(),
            kind: "VirtualService".to_string(),
        };
        assert_eq!(gvk_of(&grouped).group, "networking.istio.io");
    }

    #[test]
    fn test_dynamic_conversion_keeps_type_meta() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("registry".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            ..Secret::default()
        };
        let object = to_dynamic(&secret).unwrap();
        assert_eq!(object.types.as_ref().map(|t| t.kind.as_str()), Some("Secret"));
        assert_eq!(
            ObjectKey::of(&object),
            Some(ObjectKey::namespaced("default", "registry"))
        );

        let back: Secret = from_dynamic(object).unwrap();
        assert_eq!(back.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::namespaced("ns", "a").to_string(), "ns/a");
        assert_eq!(ObjectKey::cluster("a").to_string(), "a");
    }
}
