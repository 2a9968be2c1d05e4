//! Function loop - the trampoline driving function states.
//!
//! The loop repeatedly takes the current function state, hands it off if
//! another team is responsible for it, otherwise attaches its thread state
//! to the worker and executes it. The returned continuation becomes the
//! next state, so no call stack grows with the length of the work.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};
use trellis_core::{Escalation, TeamId};

use crate::active::WorkerContext;
use crate::engine::EngineConfig;
use crate::function::FunctionState;
use crate::team::TeamManagement;
use crate::thread::ThreadState;

/// Context handed to each executing function state
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    worker: &'a WorkerContext,
    team: Option<TeamId>,
}

impl<'a> ExecutionContext<'a> {
    /// Create a context for `worker` running on `team`
    #[must_use]
    pub const fn new(worker: &'a WorkerContext, team: Option<TeamId>) -> Self {
        Self { worker, team }
    }

    /// Worker executing the function
    #[must_use]
    pub const fn worker(&self) -> &'a WorkerContext {
        self.worker
    }

    /// Team executing the function, `None` for an invoking thread
    #[must_use]
    pub const fn team(&self) -> Option<TeamId> {
        self.team
    }
}

struct Attachment<'a> {
    worker: &'a WorkerContext,
}

impl<'a> Attachment<'a> {
    fn attach(worker: &'a WorkerContext, thread: Arc<ThreadState>) -> Self {
        worker.attach(thread, false);
        Self { worker }
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.worker.detach() {
            error!(worker = %self.worker.id(), error = %e, "detach failed");
        }
    }
}

/// Trampoline executing function states on one worker
#[derive(Debug, Clone)]
pub struct FunctionLoop {
    team: Option<TeamManagement>,
    catch_panics: bool,
    max_steps: Option<usize>,
}

impl FunctionLoop {
    /// Loop for an invoking thread that belongs to no team
    #[must_use]
    pub fn new() -> Self {
        Self {
            team: None,
            catch_panics: true,
            max_steps: None,
        }
    }

    /// Loop configured from the engine configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            team: None,
            catch_panics: config.catch_panics,
            max_steps: config.max_steps_per_job,
        }
    }

    /// Run as a worker of `team`
    #[must_use]
    pub fn with_team(mut self, team: TeamManagement) -> Self {
        self.team = Some(team);
        self
    }

    /// Enable/disable converting panics into escalations
    #[must_use]
    pub fn with_catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    /// Yield back to the team after `max_steps`
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    fn team_id(&self) -> Option<TeamId> {
        self.team.as_ref().map(TeamManagement::id)
    }

    /// Run `function` and its continuations until none remain or the work
    /// is handed to another team.
    ///
    /// When the step limit is reached on a team worker, the remaining work
    /// is re-assigned to the same team.
    pub fn run(&self, worker: &WorkerContext, function: FunctionState) {
        let Some(remaining) = self.drive(worker, function, self.max_steps) else {
            return;
        };
        match &self.team {
            Some(team) => {
                debug!(team = %team.name(), "step limit reached, yielding");
                team.assign_job(remaining);
            }
            None => {
                self.drive(worker, remaining, None);
            }
        }
    }

    /// Run at most `max_steps` steps, returning the remaining work
    #[must_use]
    pub fn run_bounded(
        &self,
        worker: &WorkerContext,
        function: FunctionState,
        max_steps: usize,
    ) -> Option<FunctionState> {
        self.drive(worker, function, Some(max_steps))
    }

    fn drive(
        &self,
        worker: &WorkerContext,
        function: FunctionState,
        limit: Option<usize>,
    ) -> Option<FunctionState> {
        let mut next = Some(function);
        let mut steps = 0_usize;
        while let Some(function) = next.take() {
            if let Some(team) = function.responsible_team() {
                if self.team_id() != Some(team.id()) {
                    function
                        .thread_state()
                        .process()
                        .office()
                        .metrics()
                        .record_team_handoff();
                    team.assign_job(function);
                    return None;
                }
            }
            if limit.is_some_and(|limit| steps >= limit) {
                return Some(function);
            }
            next = self.execute(worker, function);
            steps += 1;
        }
        None
    }

    /// Execute a single function state, returning its continuation.
    ///
    /// The function's thread state is attached for the duration of the step.
    /// Escalations and captured panics are routed to the function's
    /// escalation handling.
    pub fn execute(&self, worker: &WorkerContext, mut function: FunctionState) -> Option<FunctionState> {
        let thread = Arc::clone(function.thread_state());
        let _attachment = Attachment::attach(worker, Arc::clone(&thread));
        let context = ExecutionContext::new(worker, self.team_id());

        let outcome = if self.catch_panics {
            catch_unwind(AssertUnwindSafe(|| execute_step(&thread, &context, &mut function)))
                .unwrap_or_else(|payload| Err(Escalation::from_panic(payload)))
        } else {
            execute_step(&thread, &context, &mut function)
        };
        thread.process().office().metrics().record_function_executed();

        match outcome {
            Ok(next) => next,
            Err(escalation) => {
                debug!(thread = %thread.id(), escalation = %escalation, "function escalated");
                function.handle_escalation(escalation, None)
            }
        }
    }
}

impl Default for FunctionLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn execute_step(
    thread: &Arc<ThreadState>,
    context: &ExecutionContext<'_>,
    function: &mut FunctionState,
) -> Result<Option<FunctionState>, Escalation> {
    if function.requires_thread_state_safety() {
        thread.run_thread_safe(context.worker(), || function.execute(context))
    } else {
        function.execute(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionStep;
    use crate::managed_function::ManagedFunctionMetaData;
    use crate::team::PassiveTeam;
    use crate::testing::{self, Recorder};

    struct Countdown {
        thread: Arc<ThreadState>,
        remaining: usize,
        safe: bool,
        recorder: Recorder,
    }

    impl FunctionStep for Countdown {
        fn thread_state(&self) -> &Arc<ThreadState> {
            &self.thread
        }

        fn requires_thread_state_safety(&self) -> bool {
            self.safe
        }

        fn execute(
            &mut self,
            context: &ExecutionContext<'_>,
        ) -> Result<Option<FunctionState>, Escalation> {
            let held = self.thread.safety_lock().is_held_by(context.worker().id());
            self.recorder.push(format!("{} {}", self.remaining, held));
            if self.remaining == 0 {
                return Ok(None);
            }
            Ok(Some(FunctionState::step(Countdown {
                thread: Arc::clone(&self.thread),
                remaining: self.remaining - 1,
                safe: self.safe,
                recorder: self.recorder.clone(),
            })))
        }
    }

    #[test]
    fn test_run_executes_all_continuations() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();
        let worker = WorkerContext::new();

        FunctionLoop::new().run(
            &worker,
            FunctionState::step(Countdown {
                thread,
                remaining: 2,
                safe: false,
                recorder: recorder.clone(),
            }),
        );
        assert_eq!(recorder.entries(), vec!["2 false", "1 false", "0 false"]);
        assert_eq!(worker.depth(), 0);
    }

    #[test]
    fn test_safe_step_holds_lock() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();
        let worker = WorkerContext::new();

        FunctionLoop::new().run(
            &worker,
            FunctionState::step(Countdown {
                thread: Arc::clone(&thread),
                remaining: 0,
                safe: true,
                recorder: recorder.clone(),
            }),
        );
        assert_eq!(recorder.entries(), vec!["0 true"]);
        assert_eq!(thread.safety_lock().owner(), None);
    }

    #[test]
    fn test_run_bounded_returns_remaining() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();
        let worker = WorkerContext::new();

        let remaining = FunctionLoop::new().run_bounded(
            &worker,
            FunctionState::step(Countdown {
                thread,
                remaining: 5,
                safe: false,
                recorder: recorder.clone(),
            }),
            2,
        );
        assert!(remaining.is_some());
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();
        let recorder = Recorder::default();

        let worker = WorkerContext::new();
        FunctionLoop::new().run(
            &worker,
            FunctionState::step(Countdown {
                thread,
                remaining: 100_000,
                safe: false,
                recorder: recorder.clone(),
            }),
        );
        assert_eq!(recorder.len(), 100_001);
    }

    #[test]
    fn test_step_limit_yields_to_team() {
        let recorder = Recorder::default();
        let team = TeamManagement::new("passive", Arc::new(PassiveTeam));
        let mut chain = None;
        for i in (0..5).rev() {
            let log = recorder.clone();
            let mut meta = ManagedFunctionMetaData::new(format!("f{i}"), move |ctx| {
                log.push(format!("depth {}", ctx.worker().depth()));
                Ok(None)
            })
            .with_team(team.clone());
            if let Some(next) = chain.take() {
                meta = meta.with_next(next);
            }
            chain = Some(meta.into_arc());
        }

        let office = testing::office_with_config(EngineConfig::default().with_max_steps_per_job(2));
        let process = testing::process(office);
        testing::run(process.invoke(chain.unwrap(), None).unwrap());

        assert_eq!(recorder.len(), 5);
        assert!(process.is_complete());
    }

    #[test]
    fn test_uncaught_panic_propagates() {
        let process = testing::process(testing::office());
        let thread = process.main_thread_state().unwrap();

        struct Explode(Arc<ThreadState>);
        impl FunctionStep for Explode {
            fn thread_state(&self) -> &Arc<ThreadState> {
                &self.0
            }
            fn execute(
                &mut self,
                _context: &ExecutionContext<'_>,
            ) -> Result<Option<FunctionState>, Escalation> {
                panic!("unguarded")
            }
        }

        let worker = WorkerContext::new();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            FunctionLoop::new()
                .with_catch_panics(false)
                .run(&worker, FunctionState::step(Explode(Arc::clone(&thread))));
        }));
        assert!(result.is_err());
        assert_eq!(worker.depth(), 0);
    }
}
