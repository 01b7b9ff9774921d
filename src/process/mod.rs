mod run;
mod signal;
mod terminate;
mod types;

pub use self::run::{ChildHandle, TokioLauncher};
pub use self::signal::{platform_signaller, Signaller};
pub use self::terminate::{escalate, ExitWaiter};
pub use self::types::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Starts child processes. All platform divergence lives behind this and the
/// handles it returns.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Never fails outright: a child that could not be started comes back as
    /// a handle without a pid and with [`ProcessHandle::spawn_error`] set.
    async fn spawn(&self, request: SpawnRequest) -> Arc<dyn ProcessHandle>;
}

#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// `None` if the spawn failed.
    fn pid(&self) -> Option<u32>;

    fn spawn_error(&self) -> Option<String>;

    /// Wait for exit. With a timeout, returns [`WaitOutcome::Running`] if the
    /// child is still alive when it elapses.
    async fn wait(&self, timeout: Option<Duration>) -> WaitOutcome;

    async fn kill(&self, graceful_timeout: Duration, forceful_timeout: Duration) -> KillResult;

    /// Most recent captured stdout/stderr, if capture was requested.
    fn output(&self) -> String {
        String::new()
    }
}
