//! # Runtime
//!
//! Process-level orchestration:
//!
//! - `bootstrap` - the startup pipeline, from type registry to running manager
//! - `lifecycle` - process phases backing the probes
//! - `signals` - OS signals wired to the shared cancellation token

pub mod bootstrap;
pub mod lifecycle;
pub mod signals;

pub use bootstrap::Bootstrap;
pub use lifecycle::{Lifecycle, Phase};

use crate::cleanup::CleanupError;
use crate::config::ConfigError;
use crate::manager::ManagerError;
use crate::reconciler::SetupError;
use crate::scheme::RegistrationError;
use lifecycle::TransitionError;
use thiserror::Error;

/// Every way startup (or the run loop) can end the process with a failure
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("type registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("orphan cleanup failed: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("reconciler setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("shutdown requested during {phase}")]
    Interrupted { phase: Phase },

    #[error(transparent)]
    Lifecycle(#[from] TransitionError),
}

impl StartupError {
    /// Phase-independent name used in the final log line
    pub fn kind(&self) -> &'static str {
        match self {
            StartupError::Config(_) => "config",
            StartupError::Registration(_) => "registration",
            StartupError::Cleanup(_) => "cleanup",
            StartupError::Manager(_) => "manager",
            StartupError::Setup(_) => "setup",
            StartupError::Metrics(_) => "metrics",
            StartupError::Interrupted { .. } => "interrupted",
            StartupError::Lifecycle(_) => "lifecycle",
        }
    }
}
