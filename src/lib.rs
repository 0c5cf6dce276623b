//! # registry-operator
//!
//! Startup orchestrator of the DockerRegistry operator.
//!
//! The process builds a type registry, removes resources orphaned by older
//! releases through a short-lived direct client, constructs the Manager with
//! a cache policy that keeps Secrets and ConfigMaps out of memory, registers
//! the three reconcilers and runs them until a shutdown signal arrives.
//!
//! - `scheme` - type registry
//! - `client` - cluster access (live, cached, in-memory fake)
//! - `cache` - informer cache and cache policy
//! - `cleanup` - orphan cleanup
//! - `manager` - controller runtime, probes, metrics endpoint, events
//! - `reconciler` - DockerRegistry, Namespace and Secret reconcilers
//! - `runtime` - startup pipeline, lifecycle and signals
//! - `config`, `observability`, `constants`, `crd` - ambient pieces

pub mod cache;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod constants;
pub mod crd;
pub mod manager;
pub mod observability;
pub mod reconciler;
pub mod runtime;
pub mod scheme;
