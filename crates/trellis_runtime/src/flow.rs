//! Flows - sequential chains of functions within a thread state.
//!
//! A flow registers with its thread state when created and leaves the
//! thread's active set exactly once, either by completing or by being
//! cancelled. The thread completes when its active set becomes empty.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use trellis_core::{Escalation, FlowId};

use crate::function::FunctionState;
use crate::managed_function::{ManagedFunctionContainer, ManagedFunctionMetaData, Parameter};
use crate::thread::{EscalationCompletion, ThreadState};

/// Callback notified when a flow finishes
pub trait FlowCompletion: Send {
    /// The flow completed normally
    fn flow_complete(self: Box<Self>) -> Option<FunctionState>;

    /// The flow was cancelled
    fn cancel(self: Box<Self>) -> Option<FunctionState> {
        None
    }
}

enum FlowState {
    Active(Option<Box<dyn FlowCompletion>>),
    Released,
}

/// Sequential chain of functions within a thread state
pub struct Flow {
    id: FlowId,
    thread: Arc<ThreadState>,
    state: Mutex<FlowState>,
}

impl Flow {
    pub(crate) fn new(
        thread: Arc<ThreadState>,
        completion: Option<Box<dyn FlowCompletion>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: FlowId::new(),
            thread,
            state: Mutex::new(FlowState::Active(completion)),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flow identifier
    #[must_use]
    pub const fn id(&self) -> FlowId {
        self.id
    }

    /// Owning thread state
    #[must_use]
    pub fn thread_state(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    /// Whether the flow completed or was cancelled
    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(*self.lock_state(), FlowState::Released)
    }

    /// Mark released. `None` if it already was, otherwise the completion callback.
    pub(crate) fn release(&self) -> Option<Option<Box<dyn FlowCompletion>>> {
        match std::mem::replace(&mut *self.lock_state(), FlowState::Released) {
            FlowState::Active(completion) => Some(completion),
            FlowState::Released => None,
        }
    }

    /// Create a function executing within this flow
    #[must_use]
    pub fn create_function(
        self: &Arc<Self>,
        function: Arc<ManagedFunctionMetaData>,
        parameter: Option<Parameter>,
    ) -> FunctionState {
        FunctionState::step(ManagedFunctionContainer::new(
            Arc::clone(self),
            function,
            parameter,
        ))
    }

    /// Cancel the flow. Removes it from the thread's active set without
    /// triggering thread completion, returning the completion's cancel work.
    pub fn cancel(self: &Arc<Self>) -> Option<FunctionState> {
        let completion = self.release()?;
        self.thread.remove_flow(self.id);
        self.thread.process().office().metrics().record_flow_cancelled();
        debug!(flow = %self.id, thread = %self.thread.id(), "flow cancelled");
        completion.and_then(|c| c.cancel())
    }

    /// Signal completion of the flow, optionally with an escalation
    #[must_use]
    pub fn flow_complete(
        self: &Arc<Self>,
        escalation: Option<Escalation>,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> FunctionState {
        self.thread
            .flow_complete(Arc::clone(self), escalation, completion)
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("thread", &self.thread.id())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Recorder, RecordingFlowCompletion};
    use proptest::prelude::*;

    #[test]
    fn test_flow_registers_with_thread() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();

        let flow = thread.create_flow(None).unwrap();
        assert_eq!(thread.active_flow_count(), 1);
        assert!(!flow.is_released());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();
        let _keep = thread.create_flow(None).unwrap();
        let flow = thread.create_flow(Some(RecordingFlowCompletion::boxed("f", &recorder))).unwrap();

        assert!(flow.cancel().is_none());
        assert!(flow.cancel().is_none());
        assert_eq!(thread.active_flow_count(), 1);
        assert!(!thread.is_complete());
        assert_eq!(recorder.entries(), vec!["cancel f"]);
    }

    #[test]
    fn test_completion_callback_runs_once() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();
        let _keep = thread.create_flow(None).unwrap();
        let flow = thread.create_flow(Some(RecordingFlowCompletion::boxed("f", &recorder))).unwrap();

        testing::run(flow.flow_complete(None, None));
        testing::run(flow.flow_complete(None, None));
        assert_eq!(recorder.entries(), vec!["complete f"]);
        assert_eq!(thread.active_flow_count(), 1);
    }

    #[test]
    fn test_last_flow_completes_thread() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let flow = thread.create_flow(None).unwrap();

        testing::run(flow.flow_complete(None, None));
        assert!(thread.is_complete());
        assert!(process.is_complete());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create,
        Complete(usize),
        Cancel(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Create),
            any::<usize>().prop_map(Op::Complete),
            any::<usize>().prop_map(Op::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_active_set_tracks_created_minus_released(ops in prop::collection::vec(op(), 0..40)) {
            let process = testing::process(testing::office());
            let thread = process.main_thread_state().unwrap();
            let _keep = thread.create_flow(None).unwrap();
            let mut flows = Vec::new();
            let mut released = std::collections::HashSet::new();

            for op in ops {
                match op {
                    Op::Create => flows.push(thread.create_flow(None).unwrap()),
                    Op::Complete(i) if !flows.is_empty() => {
                        let flow = &flows[i % flows.len()];
                        testing::run(flow.flow_complete(None, None));
                        released.insert(flow.id());
                    }
                    Op::Cancel(i) if !flows.is_empty() => {
                        let flow = &flows[i % flows.len()];
                        let _ = flow.cancel();
                        released.insert(flow.id());
                    }
                    _ => {}
                }
                prop_assert_eq!(thread.active_flow_count(), 1 + flows.len() - released.len());
            }
            prop_assert!(!thread.is_complete());
        }
    }
}
