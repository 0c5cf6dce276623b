//! Liveness and readiness evaluation.

use crate::runtime::lifecycle::Lifecycle;
use std::fmt;
use std::sync::Arc;

/// Named health check; `Err` carries the reason it failed
pub type Checker = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Check that always passes
pub fn ping() -> Checker {
    Arc::new(|| Ok(()))
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub healthy: bool,
    pub failures: Vec<String>,
}

impl ProbeReport {
    /// Plain-text body served by the probe endpoints
    pub fn body(&self) -> String {
        if self.healthy {
            "ok".to_string()
        } else {
            self.failures.join("\n")
        }
    }
}

/// Lifecycle plus the registered checks, shared with the probe handlers
pub struct ProbeState {
    lifecycle: Arc<Lifecycle>,
    liveness: Vec<(String, Checker)>,
    readiness: Vec<(String, Checker)>,
}

impl fmt::Debug for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |checks: &[(String, Checker)]| -> Vec<String> {
            checks.iter().map(|(name, _)| name.clone()).collect()
        };
        f.debug_struct("ProbeState")
            .field("phase", &self.lifecycle.phase())
            .field("liveness", &names(&self.liveness))
            .field("readiness", &names(&self.readiness))
            .finish()
    }
}

impl ProbeState {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            lifecycle,
            liveness: Vec::new(),
            readiness: Vec::new(),
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub(crate) fn has_check(&self, name: &str) -> bool {
        self.liveness
            .iter()
            .chain(&self.readiness)
            .any(|(existing, _)| existing == name)
    }

    pub(crate) fn add_liveness(&mut self, name: &str, check: Checker) {
        self.liveness.push((name.to_string(), check));
    }

    pub(crate) fn add_readiness(&mut self, name: &str, check: Checker) {
        self.readiness.push((name.to_string(), check));
    }

    /// Healthy in every phase but `Terminated`, while all liveness checks pass
    pub fn live(&self) -> ProbeReport {
        let mut failures = run_checks(&self.liveness);
        if !self.lifecycle.is_live() {
            failures.insert(0, format!("phase: {}", self.lifecycle.phase()));
        }
        report(failures)
    }

    /// Healthy only while `Running` and all readiness checks pass
    pub fn ready(&self) -> ProbeReport {
        let mut failures = run_checks(&self.readiness);
        if !self.lifecycle.is_running() {
            failures.insert(0, format!("phase: {}", self.lifecycle.phase()));
        }
        report(failures)
    }
}

fn run_checks(checks: &[(String, Checker)]) -> Vec<String> {
    checks
        .iter()
        .filter_map(|(name, check)| check().err().map(|reason| format!("{name}: {reason}")))
        .collect()
}

fn report(failures: Vec<String>) -> ProbeReport {
    ProbeReport {
        healthy: failures.is_empty(),
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lifecycle::Phase;

    fn state_at(phases: &[Phase]) -> ProbeState {
        let lifecycle = Arc::new(Lifecycle::new());
        for phase in phases {
            lifecycle.advance(*phase).unwrap();
        }
        let mut state = ProbeState::new(lifecycle);
        state.add_liveness("healthz", ping());
        state.add_readiness("readyz", ping());
        state
    }

    #[test]
    fn test_ready_only_while_running() {
        let state = state_at(&[Phase::CleaningUp, Phase::Registering]);
        assert!(state.live().healthy);
        let ready = state.ready();
        assert!(!ready.healthy);
        assert_eq!(ready.body(), "phase: Registering");

        state.lifecycle().advance(Phase::Running).unwrap();
        assert!(state.ready().healthy);
        assert_eq!(state.ready().body(), "ok");

        state.lifecycle().advance(Phase::ShuttingDown).unwrap();
        assert!(!state.ready().healthy);
        assert!(state.live().healthy);
    }

    #[test]
    fn test_not_live_once_terminated() {
        let state = state_at(&[Phase::Terminated]);
        assert!(!state.live().healthy);
    }

    #[test]
    fn test_failing_check_is_reported_by_name() {
        let mut state = state_at(&[Phase::CleaningUp, Phase::Registering, Phase::Running]);
        state.add_readiness("informers", Arc::new(|| Err("not synced".to_string())));
        let ready = state.ready();
        assert!(!ready.healthy);
        assert_eq!(ready.failures, vec!["informers: not synced".to_string()]);
        assert!(state.has_check("informers"));
    }
}
