//! # Type Registry
//!
//! Process-wide table mapping API object kinds to the definitions clients need
//! to address them (group, version, plural, scope).
//!
//! The registry is assembled once through [`TypeRegistryBuilder`] and frozen by
//! [`TypeRegistryBuilder::build`]. The resulting [`TypeRegistry`] is immutable and
//! shared as an `Arc` handle by the direct client, the cached client, the
//! informer cache and the reconcilers. Requests for a kind that was never
//! registered fail with [`UnregisteredKind`] instead of silently doing nothing.

pub mod kinds;

use kube::core::{ApiResource, GroupVersionKind};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

static KIND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Za-z0-9]*$")
        .expect("Failed to compile KIND_PATTERN - this should never happen")
});

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v[0-9]+((alpha|beta)[0-9]+)?$")
        .expect("Failed to compile VERSION_PATTERN - this should never happen")
});

static DNS_LABEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .expect("Failed to compile DNS_LABEL_PATTERN - this should never happen")
});

static DNS_SUBDOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("Failed to compile DNS_SUBDOMAIN_PATTERN - this should never happen")
});

/// Whether objects of a kind live inside a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Definition of one API object kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub scope: Scope,
    /// Holds credentials or tokens; such kinds must never be served from a cache
    pub sensitive: bool,
}

impl ObjectKind {
    /// Describe a namespaced kind from its generated resource type
    #[must_use]
    pub fn namespaced<K: kube::Resource<DynamicType = ()>>() -> Self {
        Self::from_resource::<K>(Scope::Namespaced)
    }

    /// Describe a cluster-scoped kind from its generated resource type
    #[must_use]
    pub fn cluster<K: kube::Resource<DynamicType = ()>>() -> Self {
        Self::from_resource::<K>(Scope::Cluster)
    }

    fn from_resource<K: kube::Resource<DynamicType = ()>>(scope: Scope) -> Self {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
            scope,
            sensitive: false,
        }
    }

    /// Describe a kind that has no generated Rust type (e.g. third-party CRDs)
    #[must_use]
    pub fn dynamic(group: &str, version: &str, kind: &str, plural: &str, scope: Scope) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            scope,
            sensitive: false,
        }
    }

    /// Mark the kind as holding security-sensitive material
    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    #[must_use]
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    #[must_use]
    pub fn is_namespaced(&self) -> bool {
        self.scope == Scope::Namespaced
    }

    /// Addressing information understood by `kube::Api<DynamicObject>`
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    fn validate(&self) -> Result<(), RegistrationError> {
        let malformed = |reason: &str| RegistrationError::Malformed {
            kind: display_gvk(&self.gvk()),
            reason: reason.to_string(),
        };

        if !KIND_PATTERN.is_match(&self.kind) {
            return Err(malformed("kind must be a non-empty UpperCamelCase identifier"));
        }
        if !VERSION_PATTERN.is_match(&self.version) {
            return Err(malformed("version must look like v1, v1beta1 or v1alpha1"));
        }
        if !DNS_LABEL_PATTERN.is_match(&self.plural) {
            return Err(malformed("plural must be a lowercase DNS-1123 label"));
        }
        if !self.group.is_empty() && !DNS_SUBDOMAIN_PATTERN.is_match(&self.group) {
            return Err(malformed("group must be empty or a DNS-1123 subdomain"));
        }
        Ok(())
    }
}

/// Render a GVK the way the API server does in error messages
#[must_use]
pub fn display_gvk(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}, Kind={}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Errors raised while populating the registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("malformed kind {kind}: {reason}")]
    Malformed { kind: String, reason: String },

    #[error("kind {kind} conflicts with an existing registration: {reason}")]
    Conflict { kind: String, reason: String },
}

/// A request named a kind the registry does not know
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no kind is registered for {}", display_gvk(.0))]
pub struct UnregisteredKind(pub GroupVersionKind);

/// Mutable staging area for the registry; only used during process start
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    kinds: HashMap<GroupVersionKind, ObjectKind>,
    order: Vec<GroupVersionKind>,
}

impl TypeRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind to the registry
    ///
    /// Re-registering an identical definition is accepted and changes nothing.
    pub fn register(&mut self, kind: ObjectKind) -> Result<(), RegistrationError> {
        kind.validate()?;
        let gvk = kind.gvk();

        if let Some(existing) = self.kinds.get(&gvk) {
            if *existing == kind {
                return Ok(());
            }
            return Err(RegistrationError::Conflict {
                kind: display_gvk(&gvk),
                reason: "already registered with a different plural, scope or sensitivity"
                    .to_string(),
            });
        }

        if let Some(other) = self.kinds.values().find(|other| {
            other.group == kind.group && other.version == kind.version && other.plural == kind.plural
        }) {
            return Err(RegistrationError::Conflict {
                kind: display_gvk(&gvk),
                reason: format!("plural '{}' is already claimed by {}", kind.plural, other.kind),
            });
        }

        self.order.push(gvk.clone());
        self.kinds.insert(gvk, kind);
        Ok(())
    }

    /// Register a group of kinds, stopping at the first failure
    pub fn register_all(
        &mut self,
        kinds: impl IntoIterator<Item = ObjectKind>,
    ) -> Result<(), RegistrationError> {
        kinds.into_iter().try_for_each(|kind| self.register(kind))
    }

    /// Freeze the registry
    #[must_use]
    pub fn build(self) -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry {
            kinds: self.kinds,
            order: self.order,
        })
    }
}

/// Immutable, finalized kind table
#[derive(Debug)]
pub struct TypeRegistry {
    kinds: HashMap<GroupVersionKind, ObjectKind>,
    order: Vec<GroupVersionKind>,
}

impl TypeRegistry {
    pub fn lookup(&self, gvk: &GroupVersionKind) -> Result<&ObjectKind, UnregisteredKind> {
        self.kinds
            .get(gvk)
            .ok_or_else(|| UnregisteredKind(gvk.clone()))
    }

    #[must_use]
    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains_key(gvk)
    }

    /// Registered kinds in registration order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectKind> {
        self.order.iter().filter_map(|gvk| self.kinds.get(gvk))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl fmt::Display for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|k| display_gvk(&k.gvk())).collect();
        write!(f, "[{}]", names.join("; "))
    }
}
