//! Function states - the resumable units of the trampoline.
//!
//! A [`FunctionState`] is one step of work bound to a thread state. Executing
//! it yields the next state (or nothing), so long chains of work run in a
//! flat loop instead of a growing call stack.
//!
//! The variants:
//! - `Step`: application or runtime work implementing [`FunctionStep`]
//! - `Then`: a head state followed by a queue of continuations
//! - `AvoidTeam`: a wrapper that hides a responsible team while avoiding it
//! - `RunWithin`: a wrapper that re-attributes execution to another thread state

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use trellis_core::Escalation;

use crate::avoid::AvoidTeam;
use crate::executor::ExecutionContext;
use crate::team::TeamManagement;
use crate::thread::{EscalationCompletion, ThreadState};
use crate::within::RunWithin;

/// Work that can be executed by the function loop
pub trait FunctionStep: Send {
    /// Thread state the step belongs to
    fn thread_state(&self) -> &Arc<ThreadState>;

    /// Team that must execute the step; `None` runs on any team
    fn responsible_team(&self) -> Option<TeamManagement> {
        None
    }

    /// Whether the step must run while holding its thread state's safety lock
    fn requires_thread_state_safety(&self) -> bool {
        false
    }

    /// Execute the step, returning the continuation
    ///
    /// # Errors
    ///
    /// Returns the escalation raised by the step.
    fn execute(&mut self, context: &ExecutionContext<'_>)
        -> Result<Option<FunctionState>, Escalation>;

    /// Route an escalation raised by [`Self::execute`]
    fn handle_escalation(
        &mut self,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> Option<FunctionState> {
        Some(self.thread_state().handle_escalation(escalation, completion))
    }

    /// Cancel the step, returning any clean-up work
    fn cancel(&mut self) -> Option<FunctionState> {
        None
    }
}

/// A resumable unit of work
pub enum FunctionState {
    /// Single step
    Step(Box<dyn FunctionStep>),
    /// Head followed by queued continuations
    Then(ThenChain),
    /// Team avoidance wrapper
    AvoidTeam(AvoidTeam),
    /// Thread state override wrapper
    RunWithin(RunWithin),
}

impl FunctionState {
    /// Box a step
    pub fn step(step: impl FunctionStep + 'static) -> Self {
        Self::Step(Box::new(step))
    }

    /// Thread state to attach while executing
    #[must_use]
    pub fn thread_state(&self) -> &Arc<ThreadState> {
        match self {
            Self::Step(step) => step.thread_state(),
            Self::Then(chain) => chain.head.thread_state(),
            Self::AvoidTeam(avoid) => avoid.thread_state(),
            Self::RunWithin(within) => within.thread_state(),
        }
    }

    /// Team that must execute this state
    #[must_use]
    pub fn responsible_team(&self) -> Option<TeamManagement> {
        match self {
            Self::Step(step) => step.responsible_team(),
            Self::Then(chain) => chain.head.responsible_team(),
            Self::AvoidTeam(avoid) => avoid.responsible_team(),
            Self::RunWithin(within) => within.responsible_team(),
        }
    }

    /// Whether execution needs the thread state's safety lock
    #[must_use]
    pub fn requires_thread_state_safety(&self) -> bool {
        match self {
            Self::Step(step) => step.requires_thread_state_safety(),
            Self::Then(chain) => chain.head.requires_thread_state_safety(),
            Self::AvoidTeam(avoid) => avoid.requires_thread_state_safety(),
            Self::RunWithin(within) => within.requires_thread_state_safety(),
        }
    }

    /// Execute one step
    ///
    /// # Errors
    ///
    /// Returns the escalation raised by the executed step.
    pub fn execute(
        &mut self,
        context: &ExecutionContext<'_>,
    ) -> Result<Option<FunctionState>, Escalation> {
        match self {
            Self::Step(step) => step.execute(context),
            Self::Then(chain) => chain.execute(context),
            Self::AvoidTeam(avoid) => avoid.execute(context),
            Self::RunWithin(within) => within.execute(context),
        }
    }

    /// Route an escalation raised by [`Self::execute`]
    pub fn handle_escalation(
        &mut self,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> Option<FunctionState> {
        match self {
            Self::Step(step) => step.handle_escalation(escalation, completion),
            Self::Then(chain) => chain.handle_escalation(escalation, completion),
            Self::AvoidTeam(avoid) => avoid.handle_escalation(escalation, completion),
            Self::RunWithin(within) => within.handle_escalation(escalation, completion),
        }
    }

    /// Cancel this state and everything queued behind it
    pub fn cancel(&mut self) -> Option<FunctionState> {
        match self {
            Self::Step(step) => step.cancel(),
            Self::Then(chain) => chain.cancel(),
            Self::AvoidTeam(avoid) => avoid.cancel(),
            Self::RunWithin(within) => within.cancel(),
        }
    }

    /// Queue `next` to run after this state
    #[must_use]
    pub fn then(self, next: FunctionState) -> FunctionState {
        match self {
            Self::Then(mut chain) => {
                chain.push_back(next);
                Self::Then(chain)
            }
            head => {
                let mut tail = VecDeque::new();
                push_flattened(&mut tail, next);
                Self::Then(ThenChain {
                    head: Box::new(head),
                    tail,
                })
            }
        }
    }

    /// Number of states queued, including this one
    #[must_use]
    pub fn chain_len(&self) -> usize {
        match self {
            Self::Then(chain) => 1 + chain.tail.len(),
            _ => 1,
        }
    }

    /// Depth of nested wrappers and chains
    #[must_use]
    pub fn nesting_depth(&self) -> usize {
        match self {
            Self::Step(_) => 0,
            Self::Then(chain) => {
                let tail = chain.tail.iter().map(Self::nesting_depth).max().unwrap_or(0);
                1 + chain.head.nesting_depth().max(tail)
            }
            Self::AvoidTeam(avoid) => 1 + avoid.inner().nesting_depth(),
            Self::RunWithin(within) => 1 + within.inner().nesting_depth(),
        }
    }
}

impl fmt::Debug for FunctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Step(_) => "Step",
            Self::Then(_) => "Then",
            Self::AvoidTeam(_) => "AvoidTeam",
            Self::RunWithin(_) => "RunWithin",
        };
        f.debug_struct("FunctionState")
            .field("kind", &kind)
            .field("thread", &self.thread_state().id())
            .field("chain_len", &self.chain_len())
            .finish()
    }
}

/// Sequence `then_function` after `function`. `None` is the identity.
#[must_use]
pub fn then(
    function: Option<FunctionState>,
    then_function: Option<FunctionState>,
) -> Option<FunctionState> {
    match (function, then_function) {
        (None, next) => next,
        (current, None) => current,
        (Some(current), Some(next)) => Some(current.then(next)),
    }
}

fn push_flattened(tail: &mut VecDeque<FunctionState>, next: FunctionState) {
    match next {
        FunctionState::Then(chain) => {
            tail.push_back(*chain.head);
            tail.extend(chain.tail);
        }
        other => tail.push_back(other),
    }
}

/// Head state plus queued continuations.
///
/// The head is never itself a chain, so executing a chain never recurses
/// more than one level.
pub struct ThenChain {
    head: Box<FunctionState>,
    tail: VecDeque<FunctionState>,
}

impl ThenChain {
    fn from_parts(head: FunctionState, mut tail: VecDeque<FunctionState>) -> FunctionState {
        match head {
            FunctionState::Then(inner) => {
                // splice the shorter queue into the longer one
                let ThenChain {
                    head,
                    tail: mut inner_tail,
                } = inner;
                if inner_tail.len() >= tail.len() {
                    inner_tail.extend(tail);
                    Self::from_parts(*head, inner_tail)
                } else {
                    while let Some(function) = inner_tail.pop_back() {
                        tail.push_front(function);
                    }
                    Self::from_parts(*head, tail)
                }
            }
            head if tail.is_empty() => head,
            head => FunctionState::Then(Self {
                head: Box::new(head),
                tail,
            }),
        }
    }

    fn push_back(&mut self, next: FunctionState) {
        push_flattened(&mut self.tail, next);
    }

    fn advance(&mut self, next: Option<FunctionState>) -> Option<FunctionState> {
        let mut tail = std::mem::take(&mut self.tail);
        match next {
            Some(next) => Some(Self::from_parts(next, tail)),
            None => {
                let head = tail.pop_front()?;
                Some(Self::from_parts(head, tail))
            }
        }
    }

    fn execute(
        &mut self,
        context: &ExecutionContext<'_>,
    ) -> Result<Option<FunctionState>, Escalation> {
        let next = self.head.execute(context)?;
        Ok(self.advance(next))
    }

    fn handle_escalation(
        &mut self,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> Option<FunctionState> {
        let next = self.head.handle_escalation(escalation, completion);
        self.advance(next)
    }

    fn cancel(&mut self) -> Option<FunctionState> {
        let mut clean_up = self.head.cancel();
        for mut function in std::mem::take(&mut self.tail) {
            clean_up = then(clean_up, function.cancel());
        }
        clean_up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active::WorkerContext;
    use crate::testing::{self, Recorder};
    use proptest::prelude::*;

    struct Record {
        thread: Arc<ThreadState>,
        label: String,
        recorder: Recorder,
        next: Option<Box<dyn FnOnce() -> Option<FunctionState> + Send>>,
    }

    impl FunctionStep for Record {
        fn thread_state(&self) -> &Arc<ThreadState> {
            &self.thread
        }

        fn execute(
            &mut self,
            _context: &ExecutionContext<'_>,
        ) -> Result<Option<FunctionState>, Escalation> {
            self.recorder.push(self.label.clone());
            Ok(self.next.take().and_then(|next| next()))
        }

        fn cancel(&mut self) -> Option<FunctionState> {
            self.recorder.push(format!("cancel {}", self.label));
            None
        }
    }

    fn record(thread: &Arc<ThreadState>, label: &str, recorder: &Recorder) -> FunctionState {
        FunctionState::step(Record {
            thread: Arc::clone(thread),
            label: label.to_string(),
            recorder: recorder.clone(),
            next: None,
        })
    }

    fn drain(mut function: Option<FunctionState>) -> usize {
        let worker = WorkerContext::new();
        let context = ExecutionContext::new(&worker, None);
        let mut steps = 0;
        while let Some(mut current) = function.take() {
            function = current.execute(&context).unwrap();
            steps += 1;
        }
        steps
    }

    #[test]
    fn test_then_identity() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();

        assert!(then(None, None).is_none());
        let only = then(None, Some(record(&thread, "a", &recorder))).unwrap();
        assert!(matches!(only, FunctionState::Step(_)));
        let only = then(Some(record(&thread, "a", &recorder)), None).unwrap();
        assert!(matches!(only, FunctionState::Step(_)));
    }

    #[test]
    fn test_then_runs_in_order() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();

        let chain = then(
            then(
                Some(record(&thread, "a", &recorder)),
                Some(record(&thread, "b", &recorder)),
            ),
            then(
                Some(record(&thread, "c", &recorder)),
                Some(record(&thread, "d", &recorder)),
            ),
        );
        assert_eq!(chain.as_ref().map(FunctionState::chain_len), Some(4));

        drain(chain);
        assert_eq!(recorder.entries(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_continuation_runs_before_tail() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();

        let continuation_thread = Arc::clone(&thread);
        let continuation_recorder = recorder.clone();
        let head = FunctionState::step(Record {
            thread: Arc::clone(&thread),
            label: "a".to_string(),
            recorder: recorder.clone(),
            next: Some(Box::new(move || {
                then(
                    Some(record(&continuation_thread, "a1", &continuation_recorder)),
                    Some(record(&continuation_thread, "a2", &continuation_recorder)),
                )
            })),
        });

        let chain = then(Some(head), Some(record(&thread, "b", &recorder)));
        drain(chain);
        assert_eq!(recorder.entries(), vec!["a", "a1", "a2", "b"]);
    }

    #[test]
    fn test_cancel_chain_cancels_every_state() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();

        let mut chain = then(
            Some(record(&thread, "a", &recorder)),
            then(
                Some(record(&thread, "b", &recorder)),
                Some(record(&thread, "c", &recorder)),
            ),
        )
        .unwrap();
        assert!(chain.cancel().is_none());
        assert_eq!(recorder.entries(), vec!["cancel a", "cancel b", "cancel c"]);
    }

    #[test]
    fn test_long_chain_stays_flat() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();

        let mut chain = None;
        for i in 0..10_000 {
            chain = then(chain, Some(record(&thread, &i.to_string(), &recorder)));
        }
        let chain = chain.unwrap();
        assert_eq!(chain.nesting_depth(), 1);
        assert_eq!(drain(Some(chain)), 10_000);
        assert_eq!(recorder.len(), 10_000);
    }

    #[derive(Debug, Clone)]
    enum Shape {
        Leaf,
        Then(Box<Shape>, Box<Shape>),
    }

    fn shape() -> impl Strategy<Value = Shape> {
        Just(Shape::Leaf).prop_recursive(6, 64, 2, |inner| {
            (inner.clone(), inner).prop_map(|(a, b)| Shape::Then(Box::new(a), Box::new(b)))
        })
    }

    fn build(
        shape: &Shape,
        thread: &Arc<ThreadState>,
        recorder: &Recorder,
        counter: &mut usize,
        expected: &mut Vec<String>,
    ) -> FunctionState {
        match shape {
            Shape::Leaf => {
                let label = counter.to_string();
                *counter += 1;
                expected.push(label.clone());
                record(thread, &label, recorder)
            }
            Shape::Then(a, b) => {
                let first = build(a, thread, recorder, counter, expected);
                let second = build(b, thread, recorder, counter, expected);
                first.then(second)
            }
        }
    }

    proptest! {
        #[test]
        fn prop_then_preserves_order_and_stays_flat(shape in shape()) {
            let process = testing::process(testing::office());
            let thread = process.main_thread_state().unwrap();
            let recorder = Recorder::default();
            let mut counter = 0;
            let mut expected = Vec::new();

            let function = build(&shape, &thread, &recorder, &mut counter, &mut expected);
            prop_assert!(function.nesting_depth() <= 1);
            prop_assert_eq!(function.chain_len(), expected.len());

            drain(Some(function));
            prop_assert_eq!(recorder.entries(), expected);
        }
    }
}
