//! # Cache
//!
//! - [`CachePolicy`] decides which kinds the Manager's client may serve from
//!   memory
//! - [`InformerCache`] holds the watch-backed stores for the cached kinds

mod informer;

pub use informer::{CacheEvent, Informer, InformerCache, WatchFailure};

use crate::scheme::{display_gvk, kinds, ObjectKind, TypeRegistry, UnregisteredKind};
use kube::core::GroupVersionKind;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CachePolicyError {
    #[error("sensitive kind {0} must be excluded from caching")]
    SensitiveKindCached(String),

    #[error("cache policy names an unknown kind: {0}")]
    Unregistered(#[from] UnregisteredKind),
}

/// Set of kinds the Manager's client must always read live
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    uncached: HashSet<GroupVersionKind>,
}

impl CachePolicy {
    /// Policy that caches every kind
    pub fn cache_everything() -> Self {
        Self::default()
    }

    /// Exclude `kind` from caching
    #[must_use]
    pub fn disable_for(mut self, kind: &ObjectKind) -> Self {
        self.uncached.insert(kind.gvk());
        self
    }

    pub fn is_cached(&self, gvk: &GroupVersionKind) -> bool {
        !self.uncached.contains(gvk)
    }

    pub fn uncached(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.uncached.iter()
    }

    /// Check the policy against the registry it will be applied to
    ///
    /// Every excluded kind must be registered, and every sensitive kind must
    /// be excluded.
    pub fn validate(&self, registry: &TypeRegistry) -> Result<(), CachePolicyError> {
        for gvk in &self.uncached {
            registry.lookup(gvk)?;
        }
        if let Some(kind) = registry
            .iter()
            .find(|kind| kind.sensitive && self.is_cached(&kind.gvk()))
        {
            return Err(CachePolicyError::SensitiveKindCached(display_gvk(&kind.gvk())));
        }
        Ok(())
    }
}

/// Secrets and ConfigMaps are read live: secrets are never held in memory and
/// config maps are too numerous cluster-wide to be worth watching
pub fn operator_cache_policy() -> CachePolicy {
    CachePolicy::default()
        .disable_for(&kinds::secret())
        .disable_for(&kinds::config_map())
}
