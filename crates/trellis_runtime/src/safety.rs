//! Reentrant mutual exclusion keyed by worker.
//!
//! A [`SafetyLock`] guards the state of one thread state. A worker that
//! already holds the lock may acquire it again; other workers block until
//! the depth returns to zero.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use trellis_core::{ThreadStateId, WorkerId};

use crate::active::WorkerContext;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<WorkerId>,
    depth: usize,
}

/// Reentrant lock owned by at most one worker at a time
#[derive(Debug, Default)]
pub struct SafetyLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl SafetyLock {
    /// Create an unowned lock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `worker` owns the lock
    pub fn acquire(&self, worker: WorkerId) {
        let mut state = self.lock_state();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(worker);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == worker => {
                    state.depth += 1;
                    return;
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Release one level of ownership. Returns false if `worker` is not the owner.
    pub fn release(&self, worker: WorkerId) -> bool {
        let mut state = self.lock_state();
        if state.owner != Some(worker) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        true
    }

    /// Whether `worker` currently owns the lock
    #[must_use]
    pub fn is_held_by(&self, worker: WorkerId) -> bool {
        self.lock_state().owner == Some(worker)
    }

    /// Current owner, if any
    #[must_use]
    pub fn owner(&self) -> Option<WorkerId> {
        self.lock_state().owner
    }
}

struct ReleaseOnDrop<'a> {
    lock: &'a SafetyLock,
    worker: WorkerId,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        let released = self.lock.release(self.worker);
        debug_assert!(released, "safety lock released by non-owner");
    }
}

/// Run `operation` while `worker` holds `lock` on behalf of thread state `thread`.
///
/// Runs directly when the worker's current attachment is `thread` and already
/// safe. When the current attachment is `thread` but unsafe, the attachment
/// is upgraded and keeps the lock until it detaches. Otherwise the lock is
/// held only for the duration of the operation.
pub(crate) fn run_safe<R>(
    lock: &SafetyLock,
    thread: ThreadStateId,
    worker: &WorkerContext,
    operation: impl FnOnce() -> R,
) -> R {
    if worker.is_thread_state_safe(thread) {
        return operation();
    }

    lock.acquire(worker.id());
    if worker.upgrade_thread_state_safety(thread) {
        return operation();
    }

    let _release = ReleaseOnDrop {
        lock,
        worker: worker.id(),
    };
    operation()
}
