//! Platform termination primitives.
//!
//! The kill protocol only knows about two capabilities, a graceful request and
//! a forceful one. Which OS mechanism backs them is decided once, when the
//! launcher is built.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;

#[async_trait]
pub trait Signaller: Send + Sync {
    /// Ask the process (and its children) to exit.
    async fn graceful(&self, pid: u32) -> Result<()>;

    /// Terminate the process (and its children) without its cooperation.
    async fn forceful(&self, pid: u32) -> Result<()>;
}

/// Signaller for the platform this binary was built for.
#[cfg(unix)]
pub fn platform_signaller() -> Arc<dyn Signaller> {
    Arc::new(posix::PosixSignaller)
}

#[cfg(windows)]
pub fn platform_signaller() -> Arc<dyn Signaller> {
    Arc::new(windows::TreeKillSignaller)
}

#[cfg(unix)]
mod posix {
    use super::Signaller;
    use async_trait::async_trait;
    use color_eyre::eyre::WrapErr;
    use color_eyre::Result;
    use nix::errno::Errno;
    use nix::libc::pid_t;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;
    use tracing::debug;

    /// SIGTERM, then SIGKILL. Children are spawned as process group leaders,
    /// so the signal goes to the whole group and grandchildren are not
    /// orphaned.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PosixSignaller;

    #[async_trait]
    impl Signaller for PosixSignaller {
        async fn graceful(&self, pid: u32) -> Result<()> {
            signal_group(pid, Signal::SIGTERM)
        }

        async fn forceful(&self, pid: u32) -> Result<()> {
            signal_group(pid, Signal::SIGKILL)
        }
    }

    fn signal_group(pid: u32, signal: Signal) -> Result<()> {
        let pid = Pid::from_raw(pid as pid_t);
        match killpg(pid, signal) {
            Ok(()) => Ok(()),
            // Not a group leader (or the group is gone): fall back to the process itself
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {
                debug!(%pid, ?signal, "Process group unavailable, signalling process");
                kill(pid, signal).wrap_err_with(|| format!("Failed to send {signal} to {pid}"))
            }
            Err(err) => {
                Err(err).wrap_err_with(|| format!("Failed to send {signal} to group {pid}"))
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::Signaller;
    use async_trait::async_trait;
    use color_eyre::eyre::{bail, WrapErr};
    use color_eyre::Result;
    use tokio::process::Command;

    /// Windows has no graceful signal for arbitrary processes. Both tiers run
    /// `taskkill /T /F` so the two-phase timing still applies.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TreeKillSignaller;

    impl TreeKillSignaller {
        async fn tree_kill(pid: u32) -> Result<()> {
            let output = Command::new("taskkill")
                .args(["/pid", &pid.to_string(), "/t", "/f"])
                .output()
                .await
                .wrap_err("Failed to run taskkill")?;
            if !output.status.success() {
                bail!(
                    "taskkill failed for {}: {}",
                    pid,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Signaller for TreeKillSignaller {
        async fn graceful(&self, pid: u32) -> Result<()> {
            Self::tree_kill(pid).await
        }

        async fn forceful(&self, pid: u32) -> Result<()> {
            Self::tree_kill(pid).await
        }
    }
}
