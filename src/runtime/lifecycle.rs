//! # Lifecycle
//!
//! Process phases, advanced strictly forward by the startup pipeline and read
//! by the probe handlers.
//!
//! ```text
//! Initializing -> CleaningUp -> Registering -> Running -> ShuttingDown -> Terminated
//! ```
//!
//! Any phase may jump straight to `Terminated` on a fatal error.

use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Initializing,
    CleaningUp,
    Registering,
    Running,
    ShuttingDown,
    Terminated,
}

impl Phase {
    fn successor(self) -> Option<Phase> {
        match self {
            Phase::Initializing => Some(Phase::CleaningUp),
            Phase::CleaningUp => Some(Phase::Registering),
            Phase::Registering => Some(Phase::Running),
            Phase::Running => Some(Phase::ShuttingDown),
            Phase::ShuttingDown => Some(Phase::Terminated),
            Phase::Terminated => None,
        }
    }

    /// Numeric value exported as the startup phase gauge
    pub fn ordinal(self) -> i64 {
        match self {
            Phase::Initializing => 0,
            Phase::CleaningUp => 1,
            Phase::Registering => 2,
            Phase::Running => 3,
            Phase::ShuttingDown => 4,
            Phase::Terminated => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initializing => "Initializing",
            Phase::CleaningUp => "CleaningUp",
            Phase::Registering => "Registering",
            Phase::Running => "Running",
            Phase::ShuttingDown => "ShuttingDown",
            Phase::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal lifecycle transition {from} -> {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Current phase plus a channel to observe changes
#[derive(Debug)]
pub struct Lifecycle {
    phase: watch::Sender<Phase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Initializing);
        Self { phase }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Move to `next`; only the direct successor or `Terminated` is accepted
    pub fn advance(&self, next: Phase) -> Result<(), TransitionError> {
        let mut outcome = Ok(());
        self.phase.send_if_modified(|current| {
            let from = *current;
            let legal = from != Phase::Terminated
                && (from.successor() == Some(next) || next == Phase::Terminated);
            if legal {
                *current = next;
            } else {
                outcome = Err(TransitionError { from, to: next });
            }
            legal
        });
        if outcome.is_ok() {
            info!(phase = %next, "lifecycle phase changed");
        }
        outcome
    }

    pub fn is_live(&self) -> bool {
        self.phase() != Phase::Terminated
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }
}
