//! Thread states - logical threads of control within a process.
//!
//! A thread state owns its active flows, thread scoped managed objects and
//! governance. It completes exactly once, when its last flow completes or
//! when an escalation is not handled by the office procedure.
//!
//! Escalation handling walks the levels of [`EscalationLevel`] in order:
//!
//! 1. Office: the thread's escalation procedure runs a handler in a new flow
//! 2. FlowCompletion: governance is disregarded and the thread completes,
//!    handing the escalation to the completion callback if there is one
//! 3. OfficeFloor: the runtime-wide procedure runs a handler in a new thread
//! 4. Log: the escalation logger records it
//!
//! Levels never decrease, so a thread re-escalating from its own clean-up
//! moves on to the next level.

use indexmap::IndexMap;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};
use trellis_core::{CoreError, CoreResult, Escalation, FlowId, ThreadStateId};

use crate::active::{ThreadSynchroniser, WorkerContext};
use crate::escalation::EscalationLevel;
use crate::flow::{Flow, FlowCompletion};
use crate::function::{then, FunctionState};
use crate::governance::GovernanceContainer;
use crate::managed_function::Parameter;
use crate::managed_object::{
    ManagedObjectContainer, ManagedObjectIndex, ManagedObjectLookup, ManagedObjectScope,
};
use crate::meta::ThreadMetaData;
use crate::operation::ThreadOperation;
use crate::process::ProcessState;
use crate::safety::{run_safe, SafetyLock};

/// Callback notified once when a thread state completes
pub trait ThreadCompletion: Send {
    /// The thread completed, with the escalation that terminated it if any
    ///
    /// # Errors
    ///
    /// An escalation returned here is escalated on the completed thread.
    fn thread_complete(
        self: Box<Self>,
        escalation: Option<Escalation>,
    ) -> Result<Option<FunctionState>, Escalation>;
}

impl<F> ThreadCompletion for F
where
    F: FnOnce(Option<Escalation>) -> Result<Option<FunctionState>, Escalation> + Send,
{
    fn thread_complete(
        self: Box<Self>,
        escalation: Option<Escalation>,
    ) -> Result<Option<FunctionState>, Escalation> {
        (*self)(escalation)
    }
}

/// Box a closure as a [`ThreadCompletion`]
pub fn on_thread_complete<F>(callback: F) -> Box<dyn ThreadCompletion>
where
    F: FnOnce(Option<Escalation>) -> Result<Option<FunctionState>, Escalation> + Send + 'static,
{
    Box::new(callback)
}

/// Callback notified once escalation handling has moved on
pub trait EscalationCompletion: Send {
    /// Handling of the escalation finished
    fn escalation_complete(self: Box<Self>) -> Option<FunctionState>;
}

impl<F> EscalationCompletion for F
where
    F: FnOnce() -> Option<FunctionState> + Send,
{
    fn escalation_complete(self: Box<Self>) -> Option<FunctionState> {
        (*self)()
    }
}

/// Box a closure as an [`EscalationCompletion`]
pub fn on_escalation_complete<F>(callback: F) -> Box<dyn EscalationCompletion>
where
    F: FnOnce() -> Option<FunctionState> + Send + 'static,
{
    Box::new(callback)
}

struct ThreadInner {
    active_flows: IndexMap<FlowId, Arc<Flow>>,
    managed_objects: Vec<Option<ManagedObjectContainer>>,
    governance: Vec<Option<GovernanceContainer>>,
    level: EscalationLevel,
    terminal_escalation: Option<Escalation>,
    escalation_completion: Option<Box<dyn EscalationCompletion>>,
    completion: Option<Box<dyn ThreadCompletion>>,
    is_complete: bool,
}

/// Logical thread of control within a process
pub struct ThreadState {
    id: ThreadStateId,
    process: Arc<ProcessState>,
    meta: Arc<ThreadMetaData>,
    is_escalation_handler: bool,
    safety: Arc<SafetyLock>,
    inner: Mutex<ThreadInner>,
    synchronisers: Mutex<Vec<Vec<Box<dyn ThreadSynchroniser>>>>,
}

enum Escalated {
    Handled(Option<FunctionState>),
    Declined(Option<FunctionState>),
}

#[derive(Debug, Clone, Copy)]
enum GovernanceAction {
    Enforce,
    Disregard,
}

impl ThreadState {
    pub(crate) fn new(
        process: Arc<ProcessState>,
        meta: Arc<ThreadMetaData>,
        completion: Option<Box<dyn ThreadCompletion>>,
        is_escalation_handler: bool,
    ) -> Arc<Self> {
        let inner = ThreadInner {
            active_flows: IndexMap::new(),
            managed_objects: meta.managed_objects().iter().map(|_| None).collect(),
            governance: meta.governance().iter().map(|_| None).collect(),
            level: EscalationLevel::Office,
            terminal_escalation: None,
            escalation_completion: None,
            completion,
            is_complete: false,
        };
        Arc::new(Self {
            id: ThreadStateId::new(),
            process,
            meta,
            is_escalation_handler,
            safety: Arc::new(SafetyLock::new()),
            inner: Mutex::new(inner),
            synchronisers: Mutex::new(Vec::new()),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, ThreadInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Thread state identifier
    #[must_use]
    pub const fn id(&self) -> ThreadStateId {
        self.id
    }

    /// Owning process
    #[must_use]
    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    /// Thread metadata
    #[must_use]
    pub fn meta(&self) -> &ThreadMetaData {
        &self.meta
    }

    /// Whether this thread runs an office floor escalation handler
    #[must_use]
    pub const fn is_escalation_handler(&self) -> bool {
        self.is_escalation_handler
    }

    /// Current escalation level
    #[must_use]
    pub fn escalation_level(&self) -> EscalationLevel {
        self.lock_inner().level
    }

    /// Whether the thread has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock_inner().is_complete
    }

    /// Escalation that terminated the thread, once captured
    #[must_use]
    pub fn terminal_escalation(&self) -> Option<Escalation> {
        self.lock_inner().terminal_escalation.clone()
    }

    /// Number of flows in the active set
    #[must_use]
    pub fn active_flow_count(&self) -> usize {
        self.lock_inner().active_flows.len()
    }

    /// Whether governance `index` is active
    #[must_use]
    pub fn is_governance_active(&self, index: usize) -> bool {
        self.lock_inner()
            .governance
            .get(index)
            .and_then(Option::as_ref)
            .is_some_and(GovernanceContainer::is_active)
    }

    pub(crate) fn safety_lock(&self) -> &Arc<SafetyLock> {
        &self.safety
    }

    fn raise_level(&self, inner: &mut ThreadInner, level: EscalationLevel) {
        if level > inner.level {
            trace!(thread = %self.id, from = %inner.level, to = %level, "escalation level raised");
            inner.level = level;
        }
    }

    /// Create a flow and add it to the active set
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] once the thread has completed.
    pub fn create_flow(
        self: &Arc<Self>,
        completion: Option<Box<dyn FlowCompletion>>,
    ) -> CoreResult<Arc<Flow>> {
        let flow = Flow::new(Arc::clone(self), completion);
        {
            let mut inner = self.lock_inner();
            if inner.is_complete {
                warn!(thread = %self.id, "flow requested on completed thread");
                return Err(CoreError::illegal_state(format!(
                    "thread {} completed, no new flows",
                    self.id
                )));
            }
            inner.active_flows.insert(flow.id(), Arc::clone(&flow));
        }
        self.process.office().metrics().record_flow_created();
        Ok(flow)
    }

    /// Add a flow on a thread known to be active
    pub(crate) fn insert_flow(self: &Arc<Self>) -> Arc<Flow> {
        let flow = Flow::new(Arc::clone(self), None);
        self.lock_inner()
            .active_flows
            .insert(flow.id(), Arc::clone(&flow));
        self.process.office().metrics().record_flow_created();
        flow
    }

    /// Remove a flow, returning whether the active set is now empty
    pub(crate) fn remove_flow(&self, flow: FlowId) -> bool {
        let mut inner = self.lock_inner();
        inner.active_flows.shift_remove(&flow);
        inner.active_flows.is_empty()
    }

    /// Run `operation` serialised on this thread state
    pub fn run_thread_safe<R>(&self, worker: &WorkerContext, operation: impl FnOnce() -> R) -> R {
        run_safe(&self.safety, self.id, worker, operation)
    }

    /// Run `operation` serialised on the process's main thread state
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] when the process has no main thread state.
    pub fn run_process_safe<R>(
        &self,
        worker: &WorkerContext,
        operation: impl FnOnce() -> R,
    ) -> CoreResult<R> {
        let (main, lock) = self.process.main_thread_lock()?;
        Ok(run_safe(&lock, main, worker, operation))
    }

    pub(crate) fn suspend_synchronisers(&self) {
        let factories = self.meta.synchronisers();
        if factories.is_empty() {
            return;
        }
        let mut group: Vec<_> = factories.iter().map(|f| f.create()).collect();
        for synchroniser in &mut group {
            synchroniser.suspend_thread();
        }
        self.synchronisers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(group);
    }

    pub(crate) fn resume_synchronisers(&self) {
        let group = self
            .synchronisers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if let Some(mut group) = group {
            for synchroniser in group.iter_mut().rev() {
                synchroniser.resume_thread();
            }
        }
    }

    fn thread_managed_object(&self, index: usize) -> Result<Arc<dyn Any + Send + Sync>, Escalation> {
        {
            let inner = self.lock_inner();
            if inner.is_complete {
                return Err(CoreError::illegal_state(format!(
                    "managed object {index} requested after thread {} completed",
                    self.id
                ))
                .into());
            }
            match inner.managed_objects.get(index) {
                Some(Some(container)) => return Ok(container.object()),
                Some(None) => {}
                None => return Err(CoreError::not_found("Managed object", index).into()),
            }
        }

        let meta = self
            .meta
            .managed_objects()
            .get(index)
            .ok_or_else(|| CoreError::not_found("Managed object", index))?;
        let mut container = ManagedObjectContainer::load(index, meta)?;
        trace!(thread = %self.id, object = %meta.name(), "managed object loaded");

        let mut inner = self.lock_inner();
        if inner.is_complete {
            drop(inner);
            container.unload();
            return Err(CoreError::illegal_state(format!(
                "thread {} completed while managed object {index} was sourced",
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

    fn with_governance<R>(
        &self,
        index: usize,
        action: impl FnOnce(&mut GovernanceContainer) -> R,
    ) -> CoreResult<R> {
        let existing = {
            let mut inner = self.lock_inner();
            let slot = inner
                .governance
                .get_mut(index)
                .ok_or_else(|| CoreError::not_found("Governance", index))?;
            slot.take()
        };
        let mut container = match existing {
            Some(container) => container,
            None => {
                let meta = self
                    .meta
                    .governance()
                    .get(index)
                    .ok_or_else(|| CoreError::not_found("Governance", index))?;
                GovernanceContainer::new(index, meta.create())
            }
        };

        let result = action(&mut container);

        let mut inner = self.lock_inner();
        if inner.is_complete {
            drop(inner);
            container.deactivate();
        } else {
            inner.governance[index] = Some(container);
        }
        Ok(result)
    }

    /// Activate governance `index` for this thread, serialised on the
    /// thread's safety lock held by `worker`
    ///
    /// # Errors
    ///
    /// Returns the escalation raised on activation, or a not-found error.
    pub fn activate_governance(&self, worker: &WorkerContext, index: usize) -> Result<(), Escalation> {
        self.run_thread_safe(worker, || -> Result<(), Escalation> {
            self.with_governance(index, GovernanceContainer::activate)??;
            debug!(thread = %self.id, governance = %self.meta.governance()[index].name(), "governance active");
            Ok(())
        })
    }

    fn active_governance(&self) -> Vec<usize> {
        self.lock_inner()
            .governance
            .iter()
            .flatten()
            .filter(|g| g.is_active())
            .map(GovernanceContainer::index)
            .collect()
    }

    fn governance_operation(self: &Arc<Self>, index: usize, action: GovernanceAction) -> FunctionState {
        ThreadOperation::thread_safe(Arc::clone(self), move |thread, _| {
            trace!(thread = %thread.id, governance = index, action = ?action, "governance");
            thread.with_governance(index, |container| match action {
                GovernanceAction::Enforce => container.enforce(),
                GovernanceAction::Disregard => container.disregard(),
            })??;
            Ok(None)
        })
    }

    fn disregard_active_governance(self: &Arc<Self>) -> Option<FunctionState> {
        self.active_governance()
            .into_iter()
            .fold(None, |chain, index| {
                then(chain, Some(self.governance_operation(index, GovernanceAction::Disregard)))
            })
    }

    /// Escalate `escalation` on this thread state.
    ///
    /// Any outstanding escalation completion is notified first, then every
    /// active flow is cancelled before the escalation levels are consulted.
    #[must_use]
    pub fn handle_escalation(
        self: &Arc<Self>,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> FunctionState {
        ThreadOperation::thread_safe(Arc::clone(self), move |thread, _| {
            Ok(thread.escalate(escalation, completion))
        })
    }

    fn escalate(
        self: &Arc<Self>,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> Option<FunctionState> {
        self.process.office().metrics().record_escalation();
        debug!(thread = %self.id, escalation = %escalation, "escalation");

        let (previous, flows) = {
            let mut inner = self.lock_inner();
            let previous = std::mem::replace(&mut inner.escalation_completion, completion);
            let flows: Vec<_> = inner.active_flows.values().cloned().collect();
            (previous, flows)
        };
        let mut clean_up = previous.and_then(|c| c.escalation_complete());
        for flow in flows {
            clean_up = then(clean_up, flow.cancel());
        }

        let mut level = self.escalation_level();
        loop {
            match self.escalate_at(level, &escalation, clean_up) {
                Escalated::Handled(next) => return next,
                Escalated::Declined(next) => {
                    clean_up = next;
                    level = level.next();
                }
            }
        }
    }

    fn escalate_at(
        self: &Arc<Self>,
        level: EscalationLevel,
        escalation: &Escalation,
        clean_up: Option<FunctionState>,
    ) -> Escalated {
        let office = Arc::clone(self.process.office());
        match level {
            EscalationLevel::Office => {
                let Some(handler) = self.meta.escalation_procedure().find(escalation) else {
                    return Escalated::Declined(clean_up);
                };
                debug!(thread = %self.id, handler = %handler.name(), "office handles escalation");
                let flow = self.insert_flow();
                let handle = flow.create_function(
                    Arc::clone(handler.function()),
                    Some(Box::new(escalation.clone()) as Parameter),
                );
                self.raise_level(&mut self.lock_inner(), EscalationLevel::FlowCompletion);
                Escalated::Handled(then(clean_up, Some(handle)))
            }
            EscalationLevel::FlowCompletion => {
                let clean_up = then(clean_up, self.disregard_active_governance());
                let has_callback = {
                    let mut inner = self.lock_inner();
                    if inner.terminal_escalation.is_none() {
                        inner.terminal_escalation = Some(escalation.clone());
                    }
                    self.raise_level(&mut inner, EscalationLevel::OfficeFloor);
                    inner.completion.is_some()
                };
                let clean_up = then(clean_up, Some(self.complete_operation()));
                if has_callback {
                    Escalated::Handled(clean_up)
                } else {
                    Escalated::Declined(clean_up)
                }
            }
            EscalationLevel::OfficeFloor => {
                if self.is_escalation_handler {
                    return Escalated::Declined(clean_up);
                }
                let Some(handler) = office.office_floor_escalation().find(escalation) else {
                    return Escalated::Declined(clean_up);
                };
                debug!(thread = %self.id, handler = %handler.name(), "office floor handles escalation");
                self.raise_level(&mut self.lock_inner(), EscalationLevel::Log);
                let handle = self.process.spawn_thread_state(
                    Arc::clone(handler.function()),
                    Some(Box::new(escalation.clone()) as Parameter),
                    None,
                    true,
                );
                Escalated::Handled(then(clean_up, Some(handle)))
            }
            EscalationLevel::Log => {
                office
                    .logger()
                    .log_escalation(self.process.id(), self.id, escalation);
                office.metrics().record_escalation_logged();
                Escalated::Handled(clean_up)
            }
        }
    }

    pub(crate) fn flow_complete(
        self: &Arc<Self>,
        flow: Arc<Flow>,
        escalation: Option<Escalation>,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> FunctionState {
        ThreadOperation::thread_safe(Arc::clone(self), move |thread, _| {
            if let Some(escalation) = escalation {
                return Ok(thread.escalate(escalation, completion));
            }
            let mut next = completion.and_then(|c| c.escalation_complete());

            let Some(callback) = flow.release() else {
                return Ok(next);
            };
            thread.process.office().metrics().record_flow_completed();
            next = then(next, callback.and_then(|c| c.flow_complete()));
            if thread.remove_flow(flow.id()) {
                next = then(next, thread.flows_exhausted());
            }
            Ok(next)
        })
    }

    fn flows_exhausted(self: &Arc<Self>) -> Option<FunctionState> {
        let active = self.active_governance();
        if active.is_empty() {
            return self.complete_thread();
        }

        debug!(thread = %self.id, governance = active.len(), "enforcing governance before completion");
        let flow = self.insert_flow();
        let enforce = active.into_iter().fold(None, |chain, index| {
            then(chain, Some(self.governance_operation(index, GovernanceAction::Enforce)))
        });
        then(enforce, Some(flow.flow_complete(None, None)))
    }

    fn complete_operation(self: &Arc<Self>) -> FunctionState {
        ThreadOperation::thread_safe(Arc::clone(self), |thread, _| Ok(thread.complete_thread()))
    }

    fn complete_thread(self: &Arc<Self>) -> Option<FunctionState> {
        let (governance, objects, pending, finishing) = {
            let mut inner = self.lock_inner();
            let governance: Vec<_> = inner.governance.iter_mut().filter_map(Option::take).collect();
            let objects: Vec<_> = inner
                .managed_objects
                .iter_mut()
                .filter_map(Option::take)
                .collect();
            let pending = inner.escalation_completion.take();
            let finishing = if inner.is_complete {
                None
            } else {
                inner.is_complete = true;
                // later escalations re-enter at the office floor, even after a handler spawn
                if inner.level != EscalationLevel::OfficeFloor {
                    trace!(thread = %self.id, from = %inner.level, "escalation level set to office-floor");
                    inner.level = EscalationLevel::OfficeFloor;
                }
                Some((inner.completion.take(), inner.terminal_escalation.clone()))
            };
            (governance, objects, pending, finishing)
        };

        for mut container in governance {
            container.deactivate();
        }
        for mut container in objects {
            container.unload();
        }
        let mut clean_up = pending.and_then(|c| c.escalation_complete());

        let Some((callback, escalation)) = finishing else {
            return clean_up;
        };
        debug!(thread = %self.id, escalated = escalation.is_some(), "thread complete");
        self.process.office().metrics().record_thread_completed();

        if let Some(callback) = callback {
            let notify = ThreadOperation::thread_safe(Arc::clone(self), move |_, _| {
                callback.thread_complete(escalation)
            });
            clean_up = then(clean_up, Some(notify));
        }
        then(clean_up, Some(self.process.thread_complete(self)))
    }

    /// Cancel the thread: cancel every flow, disregard governance, complete
    #[must_use]
    pub fn cancel(self: &Arc<Self>) -> FunctionState {
        ThreadOperation::thread_safe(Arc::clone(self), |thread, _| {
            let flows: Vec<_> = thread.lock_inner().active_flows.values().cloned().collect();
            let mut clean_up = None;
            for flow in flows {
                clean_up = then(clean_up, flow.cancel());
            }
            clean_up = then(clean_up, thread.disregard_active_governance());
            Ok(then(clean_up, Some(thread.complete_operation())))
        })
    }
}

impl ManagedObjectLookup for ThreadState {
    fn managed_object(
        &self,
        index: ManagedObjectIndex,
    ) -> Result<Arc<dyn Any + Send + Sync>, Escalation> {
        match index.scope {
            ManagedObjectScope::Thread => self.thread_managed_object(index.index),
            ManagedObjectScope::Process => self.process.managed_object(index.index),
        }
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", &self.process.id())
            .field("level", &inner.level)
            .field("active_flows", &inner.active_flows.len())
            .field("is_complete", &inner.is_complete)
            .finish()
    }
}
