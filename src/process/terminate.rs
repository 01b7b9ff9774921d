use super::signal::Signaller;
use super::types::{KillResult, KillTier};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Something that can report whether a process exited within a deadline.
#[async_trait]
pub trait ExitWaiter: Send + Sync {
    async fn exited_within(&self, timeout: Duration) -> bool;
}

/// Two-phase termination: graceful, then forceful, then give up.
///
/// A failed signal is logged and the wait still happens, the process may have
/// exited on its own in the meantime.
#[instrument(skip(signaller, waiter))]
pub async fn escalate(
    pid: u32,
    signaller: &dyn Signaller,
    waiter: &dyn ExitWaiter,
    graceful_timeout: Duration,
    forceful_timeout: Duration,
) -> KillResult {
    if waiter.exited_within(Duration::ZERO).await {
        debug!("Process already exited");
        return KillResult::already_exited();
    }

    if let Err(err) = signaller.graceful(pid).await {
        warn!(?err, "Graceful signal failed");
    }
    if waiter.exited_within(graceful_timeout).await {
        return KillResult::terminated_by(KillTier::Graceful);
    }

    warn!("Graceful timeout reached");
    if let Err(err) = signaller.forceful(pid).await {
        warn!(?err, "Forceful signal failed");
    }
    if waiter.exited_within(forceful_timeout).await {
        return KillResult::terminated_by(KillTier::Forceful);
    }

    warn!("Forceful timeout reached, giving up");
    KillResult::survived()
}
