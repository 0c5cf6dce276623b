//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `registry_operator_reconciliations_total{controller}` - Total number of reconciliations
//! - `registry_operator_reconciliation_errors_total{controller}` - Total number of reconciliation errors
//! - `registry_operator_reconciliation_duration_seconds{controller}` - Duration of reconciliations
//! - `registry_operator_cleanup_deleted_total` - Orphaned objects removed at startup
//! - `registry_operator_startup_phase` - Current lifecycle phase (0 = Initializing ... 5 = Terminated)
//!
//! The metrics live in a [`Metrics`] value with its own registry, so tests and
//! embedded runs never share counters.

use crate::runtime::lifecycle::Phase;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::fmt;

pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconciliation_errors: IntCounterVec,
    reconciliation_duration: HistogramVec,
    cleanup_deleted: IntCounter,
    startup_phase: IntGauge,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("startup_phase", &self.startup_phase.get())
            .field("cleanup_deleted", &self.cleanup_deleted.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "registry_operator_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["controller"],
        )?;
        let reconciliation_errors = IntCounterVec::new(
            Opts::new(
                "registry_operator_reconciliation_errors_total",
                "Total number of reconciliation errors",
            ),
            &["controller"],
        )?;
        let reconciliation_duration = HistogramVec::new(
            HistogramOpts::new(
                "registry_operator_reconciliation_duration_seconds",
                "Duration of reconciliation in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["controller"],
        )?;
        let cleanup_deleted = IntCounter::new(
            "registry_operator_cleanup_deleted_total",
            "Total number of orphaned objects deleted at startup",
        )?;
        let startup_phase = IntGauge::new(
            "registry_operator_startup_phase",
            "Current lifecycle phase of the operator",
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconciliation_errors.clone()))?;
        registry.register(Box::new(reconciliation_duration.clone()))?;
        registry.register(Box::new(cleanup_deleted.clone()))?;
        registry.register(Box::new(startup_phase.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconciliation_errors,
            reconciliation_duration,
            cleanup_deleted,
            startup_phase,
        })
    }

    pub fn observe_reconciliation(&self, controller: &str, seconds: f64, failed: bool) {
        self.reconciliations.with_label_values(&[controller]).inc();
        self.reconciliation_duration
            .with_label_values(&[controller])
            .observe(seconds);
        if failed {
            self.reconciliation_errors
                .with_label_values(&[controller])
                .inc();
        }
    }

    pub fn reconciliations(&self, controller: &str) -> u64 {
        self.reconciliations.with_label_values(&[controller]).get()
    }

    pub fn reconciliation_errors(&self, controller: &str) -> u64 {
        self.reconciliation_errors
            .with_label_values(&[controller])
            .get()
    }

    pub fn add_cleanup_deleted(&self, count: usize) {
        self.cleanup_deleted
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }

    pub fn set_phase(&self, phase: Phase) {
        self.startup_phase.set(phase.ordinal());
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciliations_are_counted_per_controller() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_reconciliation("namespace", 0.2, false);
        metrics.observe_reconciliation("namespace", 0.1, true);
        metrics.observe_reconciliation("secret", 0.1, false);

        assert_eq!(metrics.reconciliations("namespace"), 2);
        assert_eq!(metrics.reconciliation_errors("namespace"), 1);
        assert_eq!(metrics.reconciliation_errors("secret"), 0);
    }

    #[test]
    fn test_encode_contains_phase_and_cleanup() {
        let metrics = Metrics::new().unwrap();
        metrics.set_phase(Phase::Running);
        metrics.add_cleanup_deleted(2);
        let text = metrics.encode().unwrap();
        assert!(text.contains("registry_operator_startup_phase 3"));
        assert!(text.contains("registry_operator_cleanup_deleted_total 2"));
    }

    #[test]
    fn test_separate_instances_do_not_share_counters() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.observe_reconciliation("secret", 0.1, false);
        assert_eq!(second.reconciliations("secret"), 0);
    }
}
