//! # Custom Resource Definitions
//!
//! CRD types owned by the registry operator.
//!
//! - `spec` - `DockerRegistry` specification
//! - `status` - status types reported by the DockerRegistry reconciler

mod spec;
mod status;

pub use spec::{DockerRegistry, DockerRegistrySpec, ExternalAccess, Storage};
pub use status::{Condition, DockerRegistryStatus, State};
