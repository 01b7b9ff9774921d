use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type PidCallback = Arc<dyn Fn(Option<u32>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// Ordered set of pid-change callbacks.
#[derive(Default)]
pub struct PidListeners {
    next: AtomicU64,
    entries: Mutex<Vec<(ListenerToken, PidCallback)>>,
}

impl PidListeners {
    pub fn add(&self, callback: PidCallback) -> ListenerToken {
        let token = ListenerToken(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((token, callback));
        token
    }

    /// Returns whether anything was removed.
    pub fn remove(&self, token: ListenerToken) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(t, _)| *t != token);
        entries.len() != before
    }

    /// Calls every listener in registration order. Runs outside the lock, so
    /// a listener may subscribe or unsubscribe.
    pub fn notify(&self, pid: Option<u32>) {
        let snapshot: Vec<PidCallback> = self
            .entries
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback(pid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returned by `Supervisor::on_pid_changed`. Dropping it keeps the listener
/// registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    listeners: Weak<PidListeners>,
    token: ListenerToken,
}

impl Subscription {
    pub(crate) fn new(listeners: &Arc<PidListeners>, token: ListenerToken) -> Self {
        Self {
            listeners: Arc::downgrade(listeners),
            token,
        }
    }

    pub fn token(&self) -> ListenerToken {
        self.token
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.token);
        }
    }
}
