//! Built-in kind registrations.
//!
//! Each function returns one API group's kinds; [`default_registry`] stacks
//! them the way the operator needs at startup.

use super::{ObjectKind, RegistrationError, Scope, TypeRegistry, TypeRegistryBuilder};
use crate::crd::DockerRegistry;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::GroupVersionKind;
use std::sync::Arc;

pub fn secret() -> ObjectKind {
    ObjectKind::namespaced::<Secret>().sensitive()
}

pub fn config_map() -> ObjectKind {
    ObjectKind::namespaced::<ConfigMap>()
}

pub fn namespace() -> ObjectKind {
    ObjectKind::cluster::<Namespace>()
}

pub fn service_account() -> ObjectKind {
    ObjectKind::namespaced::<ServiceAccount>()
}

pub fn custom_resource_definition() -> ObjectKind {
    ObjectKind::cluster::<CustomResourceDefinition>()
}

pub fn docker_registry() -> ObjectKind {
    ObjectKind::namespaced::<DockerRegistry>()
}

pub fn virtual_service() -> ObjectKind {
    ObjectKind::dynamic(
        "networking.istio.io",
        "v1beta1",
        "VirtualService",
        "virtualservices",
        Scope::Namespaced,
    )
}

pub fn destination_rule() -> ObjectKind {
    ObjectKind::dynamic(
        "networking.istio.io",
        "v1beta1",
        "DestinationRule",
        "destinationrules",
        Scope::Namespaced,
    )
}

/// Core API group kinds the reconcilers touch
pub fn core_group() -> Vec<ObjectKind> {
    vec![secret(), config_map(), namespace(), service_account()]
}

/// Operator-owned custom resources
pub fn operator_group() -> Vec<ObjectKind> {
    vec![docker_registry()]
}

pub fn apiextensions_group() -> Vec<ObjectKind> {
    vec![custom_resource_definition()]
}

/// Istio networking kinds rendered by the registry chart
pub fn istio_networking_group() -> Vec<ObjectKind> {
    vec![virtual_service(), destination_rule()]
}

/// Build the registry every component of the operator shares
pub fn default_registry() -> Result<Arc<TypeRegistry>, RegistrationError> {
    let mut builder = TypeRegistryBuilder::new();
    builder.register_all(core_group())?;
    builder.register_all(operator_group())?;
    builder.register_all(apiextensions_group())?;
    builder.register_all(istio_networking_group())?;
    Ok(builder.build())
}

/// Shorthand for the GVK of a built-in kind
pub fn gvk(kind: fn() -> ObjectKind) -> GroupVersionKind {
    kind().gvk()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_contains_every_group() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.len(), 8);
        for kind in [secret(), namespace(), docker_registry(), custom_resource_definition()] {
            assert!(registry.contains(&kind.gvk()), "{} missing", kind.kind);
        }
    }

    #[test]
    fn test_only_secrets_are_sensitive() {
        let registry = default_registry().unwrap();
        let sensitive: Vec<&str> = registry
            .iter()
            .filter(|k| k.sensitive)
            .map(|k| k.kind.as_str())
            .collect();
        assert_eq!(sensitive, vec!["Secret"]);
    }

    #[test]
    fn test_docker_registry_kind() {
        let kind = docker_registry();
        assert_eq!(kind.api_version(), "operator.kyma-project.io/v1alpha1");
        assert_eq!(kind.plural, "dockerregistries");
    }
}
