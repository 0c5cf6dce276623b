//! # DockerRegistry Spec
//!
//! Main CRD specification types.

use serde::{Deserialize, Serialize};

/// DockerRegistry Custom Resource Definition
///
/// One DockerRegistry resource describes the in-cluster registry the operator
/// installs from its bundled chart.
///
/// # Example
///
/// ```yaml
/// apiVersion: operator.kyma-project.io/v1alpha1
/// kind: DockerRegistry
/// metadata:
///   name: default
///   namespace: kyma-system
/// spec:
///   externalAccess:
///     enabled: true
///     gateway: kyma-system/kyma-gateway
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "DockerRegistry",
    group = "operator.kyma-project.io",
    version = "v1alpha1",
    namespaced,
    status = "crate::crd::DockerRegistryStatus",
    shortname = "dr",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}, {"name":"Served", "type":"string", "jsonPath":".status.served"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DockerRegistrySpec {
    /// Backing storage for registry blobs
    /// Defaults to a PersistentVolumeClaim when not set
    #[serde(default)]
    pub storage: Option<Storage>,
    /// Expose the registry outside of the cluster through an Istio gateway
    #[serde(default)]
    pub external_access: Option<ExternalAccess>,
}

/// Registry storage backend
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Storage {
    /// PersistentVolumeClaim in the registry namespace
    Pvc {
        #[serde(default)]
        size: Option<String>,
    },
    /// S3-compatible bucket, credentials read from a secret
    S3 {
        bucket: String,
        region: String,
        #[serde(rename = "secretName")]
        secret_name: String,
    },
    /// Google Cloud Storage bucket, credentials read from a secret
    Gcs {
        bucket: String,
        #[serde(rename = "secretName")]
        secret_name: String,
    },
}

/// External access configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAccess {
    #[serde(default)]
    pub enabled: bool,
    /// Gateway in `namespace/name` form
    #[serde(default)]
    pub gateway: Option<String>,
    /// Host name published through the gateway
    #[serde(default)]
    pub host: Option<String>,
}
