use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Ready,
    Failed,
}

/// One-shot readiness signal.
///
/// Resolves exactly once, to `Ready` or `Failed`, and wakes every waiter,
/// blocking threads and async tasks alike. Later resolutions are ignored.
#[derive(Debug)]
pub struct Readiness {
    state: Mutex<ReadyState>,
    cond: Condvar,
    notify: Notify,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        Self { state: Mutex::new(ReadyState::Pending), cond: Condvar::new(), notify: Notify::new() }
    }

    pub fn state(&self) -> ReadyState {
        *self.state.lock()
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != ReadyState::Pending
    }

    /// Resolve the signal. Returns false if it was already resolved.
    pub fn resolve(&self, ok: bool) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ReadyState::Pending {
                return false;
            }
            *state = if ok { ReadyState::Ready } else { ReadyState::Failed };
        }
        self.cond.notify_all();
        self.notify.notify_waiters();
        true
    }

    pub fn wait_blocking(&self) -> ReadyState {
        let mut state = self.state.lock();
        while *state == ReadyState::Pending {
            self.cond.wait(&mut state);
        }
        *state
    }

    /// Wait at most `timeout`; returns `Pending` if it expires first.
    pub fn wait_timeout(&self, timeout: Duration) -> ReadyState {
        let mut state = self.state.lock();
        if *state == ReadyState::Pending {
            self.cond.wait_while_for(&mut state, |s| *s == ReadyState::Pending, timeout);
        }
        *state
    }

    pub async fn wait(&self) -> ReadyState {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let state = self.state();
            if state != ReadyState::Pending {
                return state;
            }
            notified.await;
        }
    }
}
