use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot broadcast latch.
///
/// Once signaled the gate stays open: every blocked waiter wakes up and every
/// later [`Gate::wait`] returns immediately. A waiter may also give up on its
/// own timeout, which does not affect the gate or other waiters.
#[derive(Debug, Default)]
pub struct Gate {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate and wake all waiters. Signaling an open gate is a no-op.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        if *signaled {
            return;
        }
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the gate is signaled or `timeout` elapses (`None` waits forever).
    ///
    /// Returns `true` if the gate is open, `false` if the wait timed out.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            None => {
                let signaled = self
                    .cond
                    .wait_while(signaled, |s| !*s)
                    .unwrap_or_else(PoisonError::into_inner);
                *signaled
            }
            Some(timeout) => {
                let (signaled, _) = self
                    .cond
                    .wait_timeout_while(signaled, timeout, |s| !*s)
                    .unwrap_or_else(PoisonError::into_inner);
                *signaled
            }
        }
    }
}
