//! Processes - groups of thread states sharing process scoped objects.
//!
//! A process starts with its main thread state and completes when its last
//! thread state completes, unloading process scoped managed objects and
//! notifying completion listeners exactly once.

use indexmap::IndexMap;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, trace};
use trellis_core::{CoreError, CoreResult, Escalation, ProcessId, ThreadStateId};

use crate::engine::Office;
use crate::function::FunctionState;
use crate::managed_function::{ManagedFunctionMetaData, Parameter};
use crate::managed_object::ManagedObjectContainer;
use crate::operation::ThreadOperation;
use crate::safety::SafetyLock;
use crate::thread::{ThreadCompletion, ThreadState};

type Listener = Box<dyn FnOnce(ProcessId) + Send>;

struct MainThread {
    id: ThreadStateId,
    lock: Arc<SafetyLock>,
}

struct ProcessInner {
    threads: IndexMap<ThreadStateId, Arc<ThreadState>>,
    managed_objects: Vec<Option<ManagedObjectContainer>>,
    listeners: Vec<Listener>,
    is_complete: bool,
}

/// Group of thread states started by one invocation
pub struct ProcessState {
    id: ProcessId,
    office: Arc<Office>,
    main: OnceLock<MainThread>,
    inner: Mutex<ProcessInner>,
}

impl ProcessState {
    /// Create a process and its main thread state
    #[must_use]
    pub fn new(office: Arc<Office>, completion: Option<Box<dyn ThreadCompletion>>) -> Arc<Self> {
        let managed_objects = office
            .process_meta()
            .managed_objects()
            .iter()
            .map(|_| None)
            .collect();
        let process = Arc::new(Self {
            id: ProcessId::new(),
            office,
            main: OnceLock::new(),
            inner: Mutex::new(ProcessInner {
                threads: IndexMap::new(),
                managed_objects,
                listeners: Vec::new(),
                is_complete: false,
            }),
        });

        let main = process.register(completion, false);
        let _ = process.main.set(MainThread {
            id: main.id(),
            lock: Arc::clone(main.safety_lock()),
        });
        process.office.metrics().record_process_started();
        debug!(process = %process.id, main = %main.id(), "process started");
        process
    }

    fn lock_inner(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        completion: Option<Box<dyn ThreadCompletion>>,
        is_escalation_handler: bool,
    ) -> Arc<ThreadState> {
        let thread = ThreadState::new(
            Arc::clone(self),
            Arc::clone(self.office.process_meta().thread()),
            completion,
            is_escalation_handler,
        );
        self.lock_inner()
            .threads
            .insert(thread.id(), Arc::clone(&thread));
        self.office.metrics().record_thread_started();
        thread
    }

    /// Process identifier
    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    /// Office the process runs in
    #[must_use]
    pub fn office(&self) -> &Arc<Office> {
        &self.office
    }

    /// Whether every thread state has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock_inner().is_complete
    }

    /// Number of thread states not yet completed
    #[must_use]
    pub fn active_thread_count(&self) -> usize {
        self.lock_inner().threads.len()
    }

    /// The main thread state while it is active
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] if the main thread state is not
    /// registered or has completed.
    pub fn main_thread_state(&self) -> CoreResult<Arc<ThreadState>> {
        let main = self
            .main
            .get()
            .ok_or_else(|| CoreError::illegal_state(format!("process {} has no main thread state", self.id)))?;
        self.lock_inner()
            .threads
            .get(&main.id)
            .cloned()
            .ok_or_else(|| CoreError::illegal_state(format!("main thread state of {} completed", self.id)))
    }

    pub(crate) fn main_thread_lock(&self) -> CoreResult<(ThreadStateId, Arc<SafetyLock>)> {
        self.main
            .get()
            .map(|main| (main.id, Arc::clone(&main.lock)))
            .ok_or_else(|| CoreError::illegal_state(format!("process {} has no main thread state", self.id)))
    }

    /// Start `function` in a new flow of the main thread state
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] if the main thread state has completed.
    pub fn invoke(
        &self,
        function: Arc<ManagedFunctionMetaData>,
        parameter: Option<Parameter>,
    ) -> CoreResult<FunctionState> {
        let main = self.main_thread_state()?;
        let flow = main.create_flow(None)?;
        Ok(flow.create_function(function, parameter))
    }

    /// Register a new thread state running `function` in its first flow
    #[must_use]
    pub fn spawn_thread_state(
        self: &Arc<Self>,
        function: Arc<ManagedFunctionMetaData>,
        parameter: Option<Parameter>,
        completion: Option<Box<dyn ThreadCompletion>>,
        is_escalation_handler: bool,
    ) -> FunctionState {
        let thread = self.register(completion, is_escalation_handler);
        trace!(process = %self.id, thread = %thread.id(), handler = is_escalation_handler, "thread spawned");
        let flow = thread.insert_flow();
        flow.create_function(function, parameter)
    }

    /// Notify the process that `thread` completed
    pub(crate) fn thread_complete(self: &Arc<Self>, thread: &Arc<ThreadState>) -> FunctionState {
        let process = Arc::clone(self);
        ThreadOperation::process_safe(Arc::clone(thread), move |thread, _| {
            process.remove_thread(thread.id());
            Ok(None)
        })
    }

    fn remove_thread(&self, thread: ThreadStateId) {
        let (objects, listeners) = {
            let mut inner = self.lock_inner();
            inner.threads.shift_remove(&thread);
            if !inner.threads.is_empty() || inner.is_complete {
                return;
            }
            inner.is_complete = true;
            let objects: Vec<_> = inner
                .managed_objects
                .iter_mut()
                .filter_map(Option::take)
                .collect();
            (objects, std::mem::take(&mut inner.listeners))
        };

        for mut container in objects {
            container.unload();
        }
        debug!(process = %self.id, "process complete");
        self.office.metrics().record_process_completed();
        for listener in listeners {
            listener(self.id);
        }
    }

    /// Register a listener called once when the process completes.
    /// Called immediately if the process already completed.
    pub fn on_complete(&self, listener: impl FnOnce(ProcessId) + Send + 'static) {
        let mut inner = self.lock_inner();
        if inner.is_complete {
            drop(inner);
            listener(self.id);
        } else {
            inner.listeners.push(Box::new(listener));
        }
    }

    /// Resolve a process scoped managed object, sourcing it on first use
    ///
    /// # Errors
    ///
    /// Returns the sourcing escalation, or an error if the index is unknown
    /// or the process has completed.
    pub fn managed_object(&self, index: usize) -> Result<Arc<dyn Any + Send + Sync>, Escalation> {
        {
            let inner = self.lock_inner();
            if inner.is_complete {
                return Err(CoreError::illegal_state(format!(
                    "managed object {index} requested after process {} completed",
                    self.id
                ))
                .into());
            }
            match inner.managed_objects.get(index) {
                Some(Some(container)) => return Ok(container.object()),
                Some(None) => {}
                None => return Err(CoreError::not_found("Process managed object", index).into()),
            }
        }

        let meta = self
            .office
            .process_meta()
            .managed_objects()
            .get(index)
            .ok_or_else(|| CoreError::not_found("Process managed object", index))?;
        let mut container = ManagedObjectContainer::load(index, meta)?;
        trace!(process = %self.id, object = %meta.name(), "process managed object loaded");

        let mut inner = self.lock_inner();
        if inner.is_complete {
            drop(inner);
            container.unload();
            return Err(CoreError::illegal_state(format!(
                "process {} completed while managed object {index} was sourced",
                self.id
            ))
            .into());
        }
        match &inner.managed_objects[index] {
            Some(existing) => {
                let object = existing.object();
                drop(inner);
                container.unload();
                Ok(object)
            }
            None => {
                let object = container.object();
                inner.managed_objects[index] = Some(container);
                Ok(object)
            }
        }
    }
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("threads", &inner.threads.len())
            .field("is_complete", &inner.is_complete)
            .finish()
    }
}
