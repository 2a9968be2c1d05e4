//! Teams - pools of workers executing function states.
//!
//! A function naming a responsible team is handed to that team as a
//! [`Job`]; the team runs the job's function loop on one of its workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::trace;
use trellis_core::{CoreError, CoreResult, TeamId};

use crate::active::WorkerContext;
use crate::avoid::TeamLoad;
use crate::executor::FunctionLoop;
use crate::function::FunctionState;

/// Work assigned to a team
pub struct Job {
    function: FunctionState,
    team: TeamManagement,
}

impl Job {
    /// Team the job was assigned to
    #[must_use]
    pub fn team(&self) -> &TeamManagement {
        &self.team
    }

    /// Run the job's function loop on `worker`
    pub fn run(self, worker: &WorkerContext) {
        let config = self.function.thread_state().process().office().config().clone();
        FunctionLoop::from_config(&config)
            .with_team(self.team)
            .run(worker, self.function);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("team", &self.team.name())
            .field("function", &self.function)
            .finish()
    }
}

/// Executes jobs
pub trait Team: Send + Sync {
    /// Begin accepting jobs
    fn start_working(&self) {}

    /// Execute `job`, now or later
    fn assign_job(&self, job: Job);

    /// Stop accepting jobs
    fn stop_working(&self) {}

    /// Whether new work should avoid this team
    fn is_overloaded(&self) -> bool {
        false
    }
}

/// Named handle to a team
#[derive(Clone)]
pub struct TeamManagement {
    id: TeamId,
    name: Arc<str>,
    team: Arc<dyn Team>,
}

impl TeamManagement {
    /// Manage `team` under `name`. Names identify teams within an office.
    #[must_use]
    pub fn new(name: &str, team: Arc<dyn Team>) -> Self {
        Self {
            id: TeamId::from_name(name),
            name: Arc::from(name),
            team,
        }
    }

    /// Team identifier
    #[must_use]
    pub const fn id(&self) -> TeamId {
        self.id
    }

    /// Team name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Managed team
    #[must_use]
    pub fn team(&self) -> &Arc<dyn Team> {
        &self.team
    }

    /// Whether the team reports overload
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.team.is_overloaded()
    }

    /// Hand `function` to the team
    pub fn assign_job(&self, function: FunctionState) {
        trace!(team = %self.name, thread = %function.thread_state().id(), "job assigned");
        self.team.assign_job(Job {
            function,
            team: self.clone(),
        });
    }
}

impl fmt::Debug for TeamManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamManagement")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Team that runs jobs immediately on the assigning thread
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveTeam;

impl Team for PassiveTeam {
    fn assign_job(&self, job: Job) {
        let worker = WorkerContext::new();
        job.run(&worker);
    }
}

/// Blocking team configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockingTeamConfig {
    /// Jobs considered full capacity
    pub max_in_flight: usize,
    /// Fill ratio at which the team reports overload (0.0 - 1.0)
    pub overload_threshold: f64,
}

impl Default for BlockingTeamConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            overload_threshold: 0.8,
        }
    }
}

impl BlockingTeamConfig {
    /// Set capacity
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Set the overload threshold
    #[must_use]
    pub fn with_overload_threshold(mut self, threshold: f64) -> Self {
        self.overload_threshold = threshold;
        self
    }
}

/// Team running each job on tokio's blocking thread pool
#[derive(Debug)]
pub struct BlockingTeam {
    handle: Handle,
    load: Arc<TeamLoad>,
}

struct FinishOnDrop(Arc<TeamLoad>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.job_finished();
    }
}

impl BlockingTeam {
    /// Create a team spawning onto `handle`
    #[must_use]
    pub fn new(config: &BlockingTeamConfig, handle: Handle) -> Self {
        Self {
            handle,
            load: Arc::new(TeamLoad::new(
                config.max_in_flight,
                config.overload_threshold,
            )),
        }
    }

    /// Create a team spawning onto the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] outside a tokio runtime.
    pub fn from_current(config: &BlockingTeamConfig) -> CoreResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| CoreError::illegal_state(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(config, handle))
    }

    /// In-flight accounting
    #[must_use]
    pub fn load(&self) -> &TeamLoad {
        &self.load
    }
}

impl Team for BlockingTeam {
    fn assign_job(&self, job: Job) {
        self.load.job_started();
        let finish = FinishOnDrop(Arc::clone(&self.load));
        drop(self.handle.spawn_blocking(move || {
            let _finish = finish;
            let worker = WorkerContext::new();
            job.run(&worker);
        }));
    }

    fn is_overloaded(&self) -> bool {
        self.load.should_avoid()
    }
}
