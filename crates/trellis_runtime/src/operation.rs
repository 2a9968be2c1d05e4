//! Runtime operations on a thread state, executed as function states.

use std::sync::Arc;
use trellis_core::Escalation;

use crate::executor::ExecutionContext;
use crate::function::{FunctionState, FunctionStep};
use crate::thread::ThreadState;

type Operation = Box<
    dyn FnOnce(&Arc<ThreadState>, &ExecutionContext<'_>) -> Result<Option<FunctionState>, Escalation>
        + Send,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Safety {
    Thread,
    Process,
}

/// Closure run under the safety lock of its thread state, or of its process
pub(crate) struct ThreadOperation {
    thread: Arc<ThreadState>,
    operation: Option<Operation>,
    safety: Safety,
}

impl ThreadOperation {
    /// Operation serialised on the thread state
    pub(crate) fn thread_safe<F>(thread: Arc<ThreadState>, operation: F) -> FunctionState
    where
        F: FnOnce(&Arc<ThreadState>, &ExecutionContext<'_>) -> Result<Option<FunctionState>, Escalation>
            + Send
            + 'static,
    {
        FunctionState::step(Self {
            thread,
            operation: Some(Box::new(operation)),
            safety: Safety::Thread,
        })
    }

    /// Operation serialised on the process
    pub(crate) fn process_safe<F>(thread: Arc<ThreadState>, operation: F) -> FunctionState
    where
        F: FnOnce(&Arc<ThreadState>, &ExecutionContext<'_>) -> Result<Option<FunctionState>, Escalation>
            + Send
            + 'static,
    {
        FunctionState::step(Self {
            thread,
            operation: Some(Box::new(operation)),
            safety: Safety::Process,
        })
    }
}

impl FunctionStep for ThreadOperation {
    fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    fn execute(
        &mut self,
        context: &ExecutionContext<'_>,
    ) -> Result<Option<FunctionState>, Escalation> {
        let Some(operation) = self.operation.take() else {
            return Ok(None);
        };
        let thread = &self.thread;
        match self.safety {
            Safety::Thread => {
                thread.run_thread_safe(context.worker(), || operation(thread, context))
            }
            Safety::Process => {
                thread.run_process_safe(context.worker(), || operation(thread, context))?
            }
        }
    }
}
