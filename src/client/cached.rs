//! Manager client: cached reads for cached kinds, live reads for the rest,
//! writes always live.

use super::{ClientError, ClusterApi, ObjectKey, WatchStream};
use crate::cache::{CachePolicy, InformerCache};
use crate::scheme::TypeRegistry;
use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CachedClient {
    live: Arc<dyn ClusterApi>,
    cache: Arc<InformerCache>,
    policy: Arc<CachePolicy>,
}

impl CachedClient {
    pub fn new(live: Arc<dyn ClusterApi>, cache: Arc<InformerCache>, policy: Arc<CachePolicy>) -> Self {
        Self { live, cache, policy }
    }

    /// Resolve the kind first so unregistered kinds fail the same way on both paths
    fn reads_from_cache(&self, gvk: &GroupVersionKind) -> Result<bool, ClientError> {
        self.live.registry().lookup(gvk)?;
        Ok(self.policy.is_cached(gvk))
    }
}

#[async_trait]
impl ClusterApi for CachedClient {
    fn registry(&self) -> &Arc<TypeRegistry> {
        self.live.registry()
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError> {
        if self.reads_from_cache(gvk)? {
            self.cache.get(gvk, key).await
        } else {
            self.live.get(gvk, key).await
        }
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        if self.reads_from_cache(gvk)? {
            self.cache.list(gvk, namespace).await
        } else {
            self.live.list(gvk, namespace).await
        }
    }

    async fn apply(
        &self,
        gvk: &GroupVersionKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        self.live.apply(gvk, object).await
    }

    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.live.patch_status(gvk, key, status).await
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<bool, ClientError> {
        self.live.delete(gvk, key).await
    }

    fn watch(&self, gvk: &GroupVersionKind) -> Result<WatchStream, ClientError> {
        self.live.watch(gvk)
    }
}
