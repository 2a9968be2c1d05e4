//! Per-worker attachment of thread states.
//!
//! Every physical thread that executes functions owns a [`WorkerContext`].
//! Executing a function attaches its thread state to the worker; nested
//! attachments form a stack so the previous thread state is restored on
//! detach. Thread synchronisers are suspended and resumed as the top of the
//! stack changes, which lets ambient context follow a logical thread across
//! physical workers.
//!
//! The context is passed explicitly through the execution call chain rather
//! than kept in a thread-local.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{error, trace};
use trellis_core::{CoreError, CoreResult, Escalation, ThreadStateId, WorkerId};

use crate::managed_object::{ManagedObjectIndex, ManagedObjectLookup};
use crate::thread::ThreadState;

/// Hooks that carry ambient per-thread context across workers
pub trait ThreadSynchroniser: Send {
    /// Capture the ambient context of the worker and clear it
    fn suspend_thread(&mut self);

    /// Re-establish the captured context on the worker
    fn resume_thread(&mut self);
}

/// Creates a [`ThreadSynchroniser`] for each suspension
pub trait ThreadSynchroniserFactory: Send + Sync {
    /// Create a fresh synchroniser
    fn create(&self) -> Box<dyn ThreadSynchroniser>;
}

impl<F> ThreadSynchroniserFactory for F
where
    F: Fn() -> Box<dyn ThreadSynchroniser> + Send + Sync,
{
    fn create(&self) -> Box<dyn ThreadSynchroniser> {
        self()
    }
}

/// One attachment frame on a worker
#[derive(Debug, Clone)]
pub struct ActiveThreadState {
    thread_state: Arc<ThreadState>,
    is_thread_state_safe: bool,
}

impl ActiveThreadState {
    /// Attached thread state
    #[must_use]
    pub fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread_state
    }

    /// Whether the frame holds the thread state's safety lock
    #[must_use]
    pub const fn is_thread_state_safe(&self) -> bool {
        self.is_thread_state_safe
    }
}

/// Execution context owned by one physical thread
#[derive(Debug)]
pub struct WorkerContext {
    id: WorkerId,
    stack: RefCell<Vec<ActiveThreadState>>,
}

impl WorkerContext {
    /// Create a context with an empty attachment stack
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: WorkerId::new(),
            stack: RefCell::new(Vec::new()),
        }
    }

    /// Worker identifier
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Number of attachment frames
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Thread state at the top of the stack
    #[must_use]
    pub fn current(&self) -> Option<Arc<ThreadState>> {
        self.stack.borrow().last().map(|a| Arc::clone(&a.thread_state))
    }

    /// Snapshot of the current frame
    #[must_use]
    pub fn current_frame(&self) -> Option<ActiveThreadState> {
        self.stack.borrow().last().cloned()
    }

    /// Attach a thread state, making it current.
    ///
    /// Suspends the synchronisers of the previous attachment, acquires the
    /// safety lock when `is_thread_state_safe`, then resumes the new thread
    /// state's synchronisers.
    pub fn attach(&self, thread_state: Arc<ThreadState>, is_thread_state_safe: bool) {
        if let Some(previous) = self.current() {
            previous.suspend_synchronisers();
        }
        if is_thread_state_safe {
            thread_state.safety_lock().acquire(self.id);
        }
        thread_state.resume_synchronisers();

        trace!(worker = %self.id, thread = %thread_state.id(), safe = is_thread_state_safe, "attach");
        self.stack.borrow_mut().push(ActiveThreadState {
            thread_state,
            is_thread_state_safe,
        });
    }

    /// Detach the current thread state and restore the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] when nothing is attached.
    pub fn detach(&self) -> CoreResult<Arc<ThreadState>> {
        let active = self
            .stack
            .borrow_mut()
            .pop()
            .ok_or_else(|| CoreError::illegal_state("detach without a matching attach"))?;

        active.thread_state.suspend_synchronisers();
        if active.is_thread_state_safe {
            active.thread_state.safety_lock().release(self.id);
        }
        if let Some(previous) = self.current() {
            previous.resume_synchronisers();
        }

        trace!(worker = %self.id, thread = %active.thread_state.id(), "detach");
        Ok(active.thread_state)
    }

    /// Whether the current frame is `thread` and holds its safety lock
    #[must_use]
    pub fn is_thread_state_safe(&self, thread: ThreadStateId) -> bool {
        self.stack
            .borrow()
            .last()
            .is_some_and(|a| a.is_thread_state_safe && a.thread_state.id() == thread)
    }

    /// Mark the current frame safe if it is `thread` and not yet safe.
    ///
    /// The caller must already hold the lock; it stays held until detach.
    pub(crate) fn upgrade_thread_state_safety(&self, thread: ThreadStateId) -> bool {
        let mut stack = self.stack.borrow_mut();
        match stack.last_mut() {
            Some(active) if active.thread_state.id() == thread && !active.is_thread_state_safe => {
                active.is_thread_state_safe = true;
                true
            }
            _ => false,
        }
    }

    /// Managed object lookup for the current thread state, or `fallback`
    #[must_use]
    pub fn current_thread_context(
        &self,
        fallback: Arc<dyn ManagedObjectLookup>,
    ) -> Arc<dyn ManagedObjectLookup> {
        match self.current() {
            Some(thread) => thread as Arc<dyn ManagedObjectLookup>,
            None => fallback,
        }
    }

    /// Resolve a managed object through [`Self::current_thread_context`]
    ///
    /// # Errors
    ///
    /// Returns the escalation raised while sourcing the object.
    pub fn current_managed_object(
        &self,
        index: ManagedObjectIndex,
        fallback: Arc<dyn ManagedObjectLookup>,
    ) -> Result<Arc<dyn Any + Send + Sync>, Escalation> {
        self.current_thread_context(fallback).managed_object(index)
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        let stack = std::mem::take(self.stack.get_mut());
        if !stack.is_empty() {
            error!(worker = %self.id, frames = stack.len(), "worker dropped while attached");
        }
        for active in stack.into_iter().rev() {
            if active.is_thread_state_safe {
                active.thread_state.safety_lock().release(self.id);
            }
        }
    }
}
