//! # DockerRegistry Status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse state shown in `kubectl get dockerregistries`
#[derive(Debug, Clone, Copy, Deserialize, Serialize, schemars::JsonSchema, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Processing,
    Ready,
    Error,
    Deleting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Processing => "Processing",
            State::Ready => "Ready",
            State::Error => "Error",
            State::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// Status of the DockerRegistry resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DockerRegistryStatus {
    #[serde(default)]
    pub state: State,
    /// "True" when this resource is the one the operator serves
    #[serde(default)]
    pub served: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Secret holding in-cluster access credentials
    #[serde(default)]
    pub internal_access_secret_name: Option<String>,
    /// Secret holding external access credentials (only when external access is enabled)
    #[serde(default)]
    pub external_access_secret_name: Option<String>,
}

/// Condition represents a status condition for the resource
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of condition (True, False, Unknown)
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
