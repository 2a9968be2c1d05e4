//! Managed functions - application logic executed within a flow.
//!
//! A [`ManagedFunctionMetaData`] describes the logic, the team responsible
//! for it, the managed objects and governance it needs, and the function
//! that follows it in the same flow. Executing the last function of a flow
//! completes the flow.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::trace;
use trellis_core::{CoreError, CoreResult, Escalation};

use crate::active::WorkerContext;
use crate::executor::ExecutionContext;
use crate::flow::{Flow, FlowCompletion};
use crate::function::{then, FunctionState, FunctionStep};
use crate::managed_object::{ManagedObjectIndex, ManagedObjectLookup};
use crate::team::TeamManagement;
use crate::thread::{EscalationCompletion, ThreadCompletion, ThreadState};

/// Value passed into a function and returned to its successor
pub type Parameter = Box<dyn Any + Send>;

/// Logic of a managed function
pub trait ManagedFunctionLogic: Send + Sync {
    /// Run the logic, returning the parameter for the next function
    ///
    /// # Errors
    ///
    /// Returns the escalation raised by the logic.
    fn execute(
        &self,
        context: &mut ManagedFunctionContext<'_>,
    ) -> Result<Option<Parameter>, Escalation>;
}

impl<F> ManagedFunctionLogic for F
where
    F: Fn(&mut ManagedFunctionContext<'_>) -> Result<Option<Parameter>, Escalation> + Send + Sync,
{
    fn execute(
        &self,
        context: &mut ManagedFunctionContext<'_>,
    ) -> Result<Option<Parameter>, Escalation> {
        self(context)
    }
}

/// Configuration of a managed function
#[derive(Clone)]
pub struct ManagedFunctionMetaData {
    name: String,
    logic: Arc<dyn ManagedFunctionLogic>,
    team: Option<TeamManagement>,
    next: Option<Arc<ManagedFunctionMetaData>>,
    managed_objects: Vec<ManagedObjectIndex>,
    governance: Vec<usize>,
    requires_thread_state_safety: bool,
}

impl ManagedFunctionMetaData {
    /// Create metadata from a closure
    pub fn new<F>(name: impl Into<String>, logic: F) -> Self
    where
        F: Fn(&mut ManagedFunctionContext<'_>) -> Result<Option<Parameter>, Escalation>
            + Send
            + Sync
            + 'static,
    {
        Self::from_logic(name, Arc::new(logic))
    }

    /// Create metadata from shared logic
    pub fn from_logic(name: impl Into<String>, logic: Arc<dyn ManagedFunctionLogic>) -> Self {
        Self {
            name: name.into(),
            logic,
            team: None,
            next: None,
            managed_objects: Vec::new(),
            governance: Vec::new(),
            requires_thread_state_safety: false,
        }
    }

    /// Assign a responsible team
    #[must_use]
    pub fn with_team(mut self, team: TeamManagement) -> Self {
        self.team = Some(team);
        self
    }

    /// Function to run next in the same flow
    #[must_use]
    pub fn with_next(mut self, next: Arc<ManagedFunctionMetaData>) -> Self {
        self.next = Some(next);
        self
    }

    /// Managed object loaded before the logic runs
    #[must_use]
    pub fn with_managed_object(mut self, index: ManagedObjectIndex) -> Self {
        self.managed_objects.push(index);
        self
    }

    /// Governance activated before the logic runs
    #[must_use]
    pub fn with_governance(mut self, index: usize) -> Self {
        self.governance.push(index);
        self
    }

    /// Require the thread state's safety lock while executing
    #[must_use]
    pub fn with_thread_state_safety(mut self) -> Self {
        self.requires_thread_state_safety = true;
        self
    }

    /// Function name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Responsible team
    #[must_use]
    pub fn team(&self) -> Option<&TeamManagement> {
        self.team.as_ref()
    }

    /// Next function in the flow
    #[must_use]
    pub fn next(&self) -> Option<&Arc<ManagedFunctionMetaData>> {
        self.next.as_ref()
    }

    /// Wrap into a shareable handle
    #[must_use]
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl fmt::Debug for ManagedFunctionMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFunctionMetaData")
            .field("name", &self.name)
            .field("team", &self.team.as_ref().map(TeamManagement::name))
            .field("next", &self.next.as_ref().map(|n| n.name()))
            .field("managed_objects", &self.managed_objects)
            .field("governance", &self.governance)
            .finish_non_exhaustive()
    }
}

/// View of the runtime handed to function logic
pub struct ManagedFunctionContext<'a> {
    worker: &'a WorkerContext,
    flow: &'a Arc<Flow>,
    parameter: Option<Parameter>,
    spawned: Option<FunctionState>,
}

impl<'a> ManagedFunctionContext<'a> {
    fn new(worker: &'a WorkerContext, flow: &'a Arc<Flow>, parameter: Option<Parameter>) -> Self {
        Self {
            worker,
            flow,
            parameter,
            spawned: None,
        }
    }

    /// Thread state executing the function
    #[must_use]
    pub fn thread_state(&self) -> &Arc<ThreadState> {
        self.flow.thread_state()
    }

    /// Flow executing the function
    #[must_use]
    pub fn flow(&self) -> &Arc<Flow> {
        self.flow
    }

    /// Worker executing the function
    #[must_use]
    pub fn worker(&self) -> &WorkerContext {
        self.worker
    }

    /// Borrow the parameter as `T`
    #[must_use]
    pub fn parameter<T: Any>(&self) -> Option<&T> {
        self.parameter.as_ref()?.downcast_ref::<T>()
    }

    /// Take the parameter as `T`, leaving it in place on a type mismatch
    pub fn take_parameter<T: Any>(&mut self) -> Option<T> {
        let parameter = self.parameter.take()?;
        match parameter.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(parameter) => {
                self.parameter = Some(parameter);
                None
            }
        }
    }

    /// Resolve a managed object as `T`
    ///
    /// # Errors
    ///
    /// Returns the sourcing escalation, or a validation error on type mismatch.
    pub fn managed_object<T>(&self, index: ManagedObjectIndex) -> Result<Arc<T>, Escalation>
    where
        T: Any + Send + Sync,
    {
        let object = self.thread_state().managed_object(index)?;
        object.downcast::<T>().map_err(|_| {
            Escalation::from(CoreError::Validation {
                field: format!("managed object {index}"),
                reason: format!("not a {}", std::any::type_name::<T>()),
            })
        })
    }

    /// Start a new flow in this thread state, run before this flow continues
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] if the thread state has completed.
    pub fn spawn_flow(
        &mut self,
        function: Arc<ManagedFunctionMetaData>,
        parameter: Option<Parameter>,
        completion: Option<Box<dyn FlowCompletion>>,
    ) -> CoreResult<()> {
        let flow = self.thread_state().create_flow(completion)?;
        let spawned = flow.create_function(function, parameter);
        self.spawned = then(self.spawned.take(), Some(spawned));
        Ok(())
    }

    /// Start a new thread state in this process
    pub fn spawn_thread(
        &mut self,
        function: Arc<ManagedFunctionMetaData>,
        parameter: Option<Parameter>,
        completion: Option<Box<dyn ThreadCompletion>>,
    ) {
        let spawned = self
            .thread_state()
            .process()
            .spawn_thread_state(function, parameter, completion, false);
        self.spawned = then(self.spawned.take(), Some(spawned));
    }
}

/// Instance of a managed function bound to a flow
pub(crate) struct ManagedFunctionContainer {
    flow: Arc<Flow>,
    meta: Arc<ManagedFunctionMetaData>,
    parameter: Option<Parameter>,
}

impl ManagedFunctionContainer {
    pub(crate) fn new(
        flow: Arc<Flow>,
        meta: Arc<ManagedFunctionMetaData>,
        parameter: Option<Parameter>,
    ) -> Self {
        Self {
            flow,
            meta,
            parameter,
        }
    }
}

impl FunctionStep for ManagedFunctionContainer {
    fn thread_state(&self) -> &Arc<ThreadState> {
        self.flow.thread_state()
    }

    fn responsible_team(&self) -> Option<TeamManagement> {
        self.meta.team.clone()
    }

    fn requires_thread_state_safety(&self) -> bool {
        self.meta.requires_thread_state_safety
    }

    fn execute(
        &mut self,
        context: &ExecutionContext<'_>,
    ) -> Result<Option<FunctionState>, Escalation> {
        if self.flow.is_released() {
            trace!(function = %self.meta.name, flow = %self.flow.id(), "flow released, skipping");
            return Ok(None);
        }

        let thread = self.flow.thread_state();
        let worker = context.worker();
        thread.run_thread_safe(worker, || -> Result<(), Escalation> {
            for &index in &self.meta.governance {
                thread.activate_governance(worker, index)?;
            }
            for &index in &self.meta.managed_objects {
                thread.managed_object(index)?;
            }
            Ok(())
        })?;

        trace!(function = %self.meta.name, thread = %thread.id(), "execute");
        let mut function_context =
            ManagedFunctionContext::new(context.worker(), &self.flow, self.parameter.take());
        let result = self.meta.logic.execute(&mut function_context)?;
        let spawned = function_context.spawned.take();

        let next = match &self.meta.next {
            Some(next) => self.flow.create_function(Arc::clone(next), result),
            None => self.flow.flow_complete(None, None),
        };
        Ok(then(spawned, Some(next)))
    }

    fn handle_escalation(
        &mut self,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> Option<FunctionState> {
        Some(self.flow.flow_complete(Some(escalation), completion))
    }

    fn cancel(&mut self) -> Option<FunctionState> {
        self.flow.cancel()
    }
}
