//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Name the operator reports as field manager, event reporter and `managed-by` value
pub const OPERATOR_NAME: &str = "dockerregistry-operator";

/// Label stamped on every object the operator creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Default metrics bind address
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = ":8080";

/// Default liveness/readiness probe bind address
pub const DEFAULT_HEALTH_PROBE_BIND_ADDRESS: &str = ":8081";

/// Default chart location inside the operator image
pub const DEFAULT_CHART_PATH: &str = "/module-chart";

/// Default informer full-resync period (seconds)
/// Heals the caches from missed watch events
pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 30 * 60;

/// Default deadline for the one-shot orphan cleanup (seconds)
pub const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 10;

/// Default base namespace the operator and its registry live in
pub const DEFAULT_BASE_NAMESPACE: &str = "kyma-system";

/// Name of the secret holding in-cluster registry access credentials
pub const INTERNAL_ACCESS_SECRET_NAME: &str = "dockerregistry-config";

/// Name of the secret holding externally exposed registry access credentials
pub const EXTERNAL_ACCESS_SECRET_NAME: &str = "dockerregistry-config-external";

/// Default requeue interval for the per-kind reconcilers after a transient failure (seconds)
pub const DEFAULT_REQUEUE_SECS: u64 = 60;

/// Deprecated CRD left behind by older releases and removed at startup
pub const DEPRECATED_GITREPOSITORY_CRD: &str = "gitrepositories.serverless.kyma-project.io";

/// Delay before an informer re-opens a failed or closed watch (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Buffered cache notifications per kind before slow controllers lag
pub const CACHE_EVENT_BUFFER: usize = 1024;
