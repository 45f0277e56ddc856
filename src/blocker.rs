//! Park/wake support for [`BlockingWaitStrategy`](crate::waiting::BlockingWaitStrategy).
//!
//! A blocker is opt-in: a sequencer built without one never touches a lock on publish.

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A mutex and condition variable pair shared by a producer and the consumers parked on it.
///
/// Waiters must re-check their wake condition under the guard before calling [`wait`];
/// [`signal_all`] takes the same lock, so a signal raised after the check can not be lost.
///
/// [`wait`]: SequenceBlocker::wait
/// [`signal_all`]: SequenceBlocker::signal_all
#[derive(Debug, Default)]
pub struct SequenceBlocker {
    lock: Mutex<()>,
    condition: Condvar,
}

impl SequenceBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Release the guard and park until signalled.
    pub fn wait(&self, guard: &mut MutexGuard<'_, ()>) {
        self.condition.wait(guard);
    }

    /// Wake every parked thread.
    pub fn signal_all(&self) {
        let _guard = self.lock.lock();
        self.condition.notify_all();
    }
}
