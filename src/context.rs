use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A shared condvar cell used to signal cancellation across threads.
///
/// Threads blocked on [`Context::wait_timeout`] are woken as soon as another
/// thread calls [`Context::cancel_all`], which makes long sleeps (restart
/// backoff, shutdown deadlines) interruptible.
#[derive(Debug, Clone, Default)]
pub struct Context<T>(Arc<(Mutex<T>, Condvar)>);

impl<T> Context<T>
where
    T: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal value and wakes every thread waiting on this context.
    pub fn cancel_all(&self, val: T) {
        let (lck, cvar) = &*self.0;
        *lck.lock().expect("context lock poisoned") = val;
        cvar.notify_all();
    }

    /// Resets the cell to the default value so the context can be reused.
    pub fn reset(&self) {
        let (lck, _) = &*self.0;
        *lck.lock().expect("context lock poisoned") = T::default();
    }
}

impl Context<bool> {
    pub fn is_cancelled(&self) -> bool {
        let (lck, _) = &*self.0;
        *lck.lock().expect("context lock poisoned")
    }

    /// Blocks for up to `timeout`, returning early if the context is
    /// cancelled. Returns `true` when the wait ended due to cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lck, cvar) = &*self.0;
        let guard = lck.lock().expect("context lock poisoned");
        let (guard, _timed_out) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .expect("context lock poisoned");
        *guard
    }
}
