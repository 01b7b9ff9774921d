use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Everything the launcher needs to start a child.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// The complete environment of the child. Nothing is inherited.
    pub env: HashMap<String, String>,
    pub capture_output: bool,
}

/// How a child ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ExitInfo),
    /// The wait timed out; the child may be waited on again.
    Running,
}

impl WaitOutcome {
    pub fn has_exited(&self) -> bool {
        matches!(self, WaitOutcome::Exited(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillTier {
    Graceful,
    Forceful,
}

impl fmt::Display for KillTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillTier::Graceful => f.write_str("graceful"),
            KillTier::Forceful => f.write_str("forceful"),
        }
    }
}

/// Outcome of the two-phase kill protocol.
///
/// `tier` names the signal that ended the process. It is `None` when the
/// process was already gone before any signal was sent, or when neither tier
/// could confirm termination (`success == false`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillResult {
    pub success: bool,
    pub tier: Option<KillTier>,
}

impl KillResult {
    pub fn terminated_by(tier: KillTier) -> Self {
        Self {
            success: true,
            tier: Some(tier),
        }
    }

    pub fn already_exited() -> Self {
        Self {
            success: true,
            tier: None,
        }
    }

    pub fn survived() -> Self {
        Self {
            success: false,
            tier: None,
        }
    }
}
