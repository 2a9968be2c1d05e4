//! Re-attribute execution of a function to another thread state.

use std::sync::Arc;
use trellis_core::{Escalation, ThreadStateId};

use crate::executor::ExecutionContext;
use crate::function::FunctionState;
use crate::team::TeamManagement;
use crate::thread::{EscalationCompletion, ThreadState};

/// Wrapper attaching `thread_state` instead of the function's own thread state.
///
/// Continuations that still belong to the original thread state stay
/// wrapped; continuations on any other thread state pass through unchanged.
pub struct RunWithin {
    inner: Box<FunctionState>,
    original: ThreadStateId,
    thread_state: Arc<ThreadState>,
}

/// Run `function` attached to `thread_state`
#[must_use]
pub fn run_within(function: FunctionState, thread_state: Arc<ThreadState>) -> FunctionState {
    let original = function.thread_state().id();
    if original == thread_state.id() {
        return function;
    }
    FunctionState::RunWithin(RunWithin {
        inner: Box::new(function),
        original,
        thread_state,
    })
}

impl RunWithin {
    pub(crate) fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread_state
    }

    pub(crate) fn inner(&self) -> &FunctionState {
        &self.inner
    }

    pub(crate) fn responsible_team(&self) -> Option<TeamManagement> {
        self.inner.responsible_team()
    }

    pub(crate) fn requires_thread_state_safety(&self) -> bool {
        self.inner.requires_thread_state_safety()
    }

    fn rewrap(&self, next: Option<FunctionState>) -> Option<FunctionState> {
        next.map(|function| {
            if function.thread_state().id() == self.original {
                FunctionState::RunWithin(RunWithin {
                    inner: Box::new(function),
                    original: self.original,
                    thread_state: Arc::clone(&self.thread_state),
                })
            } else {
                function
            }
        })
    }

    pub(crate) fn execute(
        &mut self,
        context: &ExecutionContext<'_>,
    ) -> Result<Option<FunctionState>, Escalation> {
        let next = self.inner.execute(context)?;
        Ok(self.rewrap(next))
    }

    pub(crate) fn handle_escalation(
        &mut self,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> Option<FunctionState> {
        let next = self.inner.handle_escalation(escalation, completion);
        self.rewrap(next)
    }

    pub(crate) fn cancel(&mut self) -> Option<FunctionState> {
        let next = self.inner.cancel();
        self.rewrap(next)
    }
}
