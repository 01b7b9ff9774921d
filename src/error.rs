use crate::process::ExitInfo;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The readiness loop ran out of time.
#[derive(Debug, Clone, Error)]
#[error("port {port} did not become ready within {timeout:?} ({attempts} checks)")]
pub struct ProbeTimeout {
    pub port: u16,
    pub timeout: Duration,
    pub attempts: u32,
}

/// Root cause of a failed start attempt.
#[derive(Debug, Error)]
pub enum StartFailure {
    #[error("executable {0:?} is not installed")]
    NotInstalled(PathBuf),
    #[error("no free port available")]
    PortAllocation(#[source] std::io::Error),
    #[error("invalid template {template:?}: {reason}")]
    Template { template: String, reason: String },
    #[error("failed to spawn {program:?}: {reason}")]
    Spawn { program: PathBuf, reason: String },
    #[error(transparent)]
    Readiness(#[from] ProbeTimeout),
    #[error("process exited before becoming ready ({exit})")]
    ExitedBeforeReady { exit: ExitInfo, output: String },
}

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// Shared by every caller that waited on the same start attempt.
    #[error("failed to start {name}")]
    StartFailed {
        name: String,
        #[source]
        cause: Arc<StartFailure>,
    },
    #[error("start attempt for {name} was aborted")]
    Aborted { name: String },
}

impl SupervisorError {
    pub fn start_failed(name: impl Into<String>, cause: StartFailure) -> Self {
        SupervisorError::StartFailed {
            name: name.into(),
            cause: Arc::new(cause),
        }
    }

    pub fn cause(&self) -> Option<&StartFailure> {
        match self {
            SupervisorError::StartFailed { cause, .. } => Some(cause.as_ref()),
            SupervisorError::Aborted { .. } => None,
        }
    }
}
