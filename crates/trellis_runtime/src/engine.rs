//! Execution engine for processes.
//!
//! An [`Office`] bundles the configuration shared by every process: thread
//! and process metadata, the office floor escalation procedure, the
//! escalation logger, the teams and metrics. The [`ExecutionEngine`] starts
//! the teams and processes
//! and drives them with a [`FunctionLoop`] on the calling thread until they
//! complete or hand off to a team.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use trellis_core::{CoreResult, ProcessId};

use crate::active::WorkerContext;
use crate::escalation::{EscalationLogger, EscalationProcedure, TracingEscalationLogger};
use crate::executor::FunctionLoop;
use crate::managed_function::{ManagedFunctionMetaData, Parameter};
use crate::meta::ProcessMetaData;
use crate::monitor::Metrics;
use crate::process::ProcessState;
use crate::team::TeamManagement;
use crate::thread::ThreadCompletion;

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Convert panics in function logic into escalations
    pub catch_panics: bool,
    /// Steps a team job runs before yielding back to its team
    pub max_steps_per_job: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catch_panics: true,
            max_steps_per_job: None,
        }
    }
}

impl EngineConfig {
    /// Set panic capture
    #[must_use]
    pub fn with_catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    /// Set the per-job step limit
    #[must_use]
    pub fn with_max_steps_per_job(mut self, max_steps: usize) -> Self {
        self.max_steps_per_job = Some(max_steps);
        self
    }

    /// Parse from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the JSON is malformed.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Configuration shared by every process of an application
pub struct Office {
    name: String,
    config: EngineConfig,
    process_meta: ProcessMetaData,
    office_floor_escalation: EscalationProcedure,
    logger: Arc<dyn EscalationLogger>,
    teams: Vec<TeamManagement>,
    metrics: Metrics,
}

impl Office {
    /// Create an office
    pub fn new(name: impl Into<String>, process_meta: ProcessMetaData) -> Self {
        Self {
            name: name.into(),
            config: EngineConfig::default(),
            process_meta,
            office_floor_escalation: EscalationProcedure::new(),
            logger: Arc::new(TracingEscalationLogger),
            teams: Vec::new(),
            metrics: Metrics::new(),
        }
    }

    /// Set the engine configuration
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the runtime-wide escalation procedure
    #[must_use]
    pub fn with_office_floor_escalation(mut self, procedure: EscalationProcedure) -> Self {
        self.office_floor_escalation = procedure;
        self
    }

    /// Set the sink for unhandled escalations
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn EscalationLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Register a team started and stopped with the engine
    #[must_use]
    pub fn with_team(mut self, team: TeamManagement) -> Self {
        self.teams.push(team);
        self
    }

    /// Registered teams
    #[must_use]
    pub fn teams(&self) -> &[TeamManagement] {
        &self.teams
    }

    /// Registered team by name
    #[must_use]
    pub fn team(&self, name: &str) -> Option<&TeamManagement> {
        self.teams.iter().find(|team| team.name() == name)
    }

    /// Office name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Process metadata
    #[must_use]
    pub fn process_meta(&self) -> &ProcessMetaData {
        &self.process_meta
    }

    /// Runtime-wide escalation procedure
    #[must_use]
    pub fn office_floor_escalation(&self) -> &EscalationProcedure {
        &self.office_floor_escalation
    }

    /// Escalation logger
    #[must_use]
    pub fn logger(&self) -> &Arc<dyn EscalationLogger> {
        &self.logger
    }

    /// Execution metrics
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl fmt::Debug for Office {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Office")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("process_meta", &self.process_meta)
            .field("office_floor_escalation", &self.office_floor_escalation)
            .field("teams", &self.teams)
            .finish_non_exhaustive()
    }
}

/// Handle to a started process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    process: Arc<ProcessState>,
}

impl ProcessHandle {
    /// Process identifier
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.process.id()
    }

    /// Process state
    #[must_use]
    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    /// Whether the process completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.process.is_complete()
    }

    /// Receiver resolved when the process completes
    #[must_use]
    pub fn completion(&self) -> oneshot::Receiver<ProcessId> {
        let (sender, receiver) = oneshot::channel();
        self.process.on_complete(move |id| {
            let _ = sender.send(id);
        });
        receiver
    }
}

/// Starts processes of an office
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    office: Arc<Office>,
}

impl ExecutionEngine {
    /// Create an engine for `office`, starting its teams
    #[must_use]
    pub fn new(office: Office) -> Self {
        for team in &office.teams {
            debug!(office = %office.name, team = team.name(), "starting team");
            team.team().start_working();
        }
        Self {
            office: Arc::new(office),
        }
    }

    /// Stop the office teams. Jobs already assigned are left to the teams.
    pub fn stop(&self) {
        for team in &self.office.teams {
            debug!(office = %self.office.name, team = team.name(), "stopping team");
            team.team().stop_working();
        }
    }

    /// Office of the engine
    #[must_use]
    pub fn office(&self) -> &Arc<Office> {
        &self.office
    }

    /// Start a process running `function` in its main thread state.
    ///
    /// Runs on the calling thread until the process completes or its work
    /// is handed to a team.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be started.
    pub fn invoke_process(
        &self,
        function: Arc<ManagedFunctionMetaData>,
        parameter: Option<Parameter>,
        completion: Option<Box<dyn ThreadCompletion>>,
    ) -> CoreResult<ProcessHandle> {
        let process = ProcessState::new(Arc::clone(&self.office), completion);
        info!(office = %self.office.name, process = %process.id(), function = %function.name(), "invoking process");
        let start = process.invoke(function, parameter)?;

        let worker = WorkerContext::new();
        FunctionLoop::from_config(&self.office.config).run(&worker, start);
        Ok(ProcessHandle { process })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationHandler;
    use crate::meta::ThreadMetaData;
    use crate::team::{Job, Team};
    use crate::testing::{self, Recorder, RecordingLogger};
    use crate::thread::on_thread_complete;
    use trellis_core::{CoreError, Escalation};

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert!(config.catch_panics);
        assert_eq!(config.max_steps_per_job, None);
    }

    #[test]
    fn test_config_from_json() {
        let config = EngineConfig::from_json(r#"{"max_steps_per_job": 64}"#).unwrap();
        assert!(config.catch_panics);
        assert_eq!(config.max_steps_per_job, Some(64));

        let err = EngineConfig::from_json("{").unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn test_invoke_process_runs_to_completion() {
        let recorder = Recorder::default();
        let log = recorder.clone();
        let function = ManagedFunctionMetaData::new("hello", move |_| {
            log.push("hello");
            Ok(None)
        })
        .into_arc();

        let engine = ExecutionEngine::new(Office::new("test", ProcessMetaData::default()));
        let log = recorder.clone();
        let handle = engine
            .invoke_process(
                function,
                None,
                Some(on_thread_complete(move |escalation| {
                    log.push(format!("complete {}", escalation.is_none()));
                    Ok(None)
                })),
            )
            .unwrap();

        assert!(handle.is_complete());
        assert_eq!(recorder.entries(), vec!["hello", "complete true"]);

        let snapshot = engine.office().metrics().snapshot();
        assert_eq!(snapshot.processes_started, 1);
        assert_eq!(snapshot.processes_completed, 1);
        assert_eq!(snapshot.threads_completed, 1);
    }

    #[test]
    fn test_panic_becomes_escalation() {
        let logger = RecordingLogger::default();
        let function = ManagedFunctionMetaData::new("explodes", |_| -> Result<Option<Parameter>, Escalation> {
            panic!("boom");
        })
        .into_arc();

        let office = Office::new("test", ProcessMetaData::default()).with_logger(Arc::new(logger.clone()));
        let engine = ExecutionEngine::new(office);
        let handle = engine.invoke_process(function, None, None).unwrap();

        assert!(handle.is_complete());
        assert_eq!(logger.entries(), vec!["function panicked: boom"]);
    }

    #[test]
    fn test_office_floor_handler_runs_in_new_thread() {
        let recorder = Recorder::default();
        let log = recorder.clone();
        let handler = ManagedFunctionMetaData::new("floor", move |ctx| {
            let escalation = ctx.parameter::<Escalation>().map(ToString::to_string);
            log.push(format!("floor {}", escalation.unwrap_or_default()));
            assert!(ctx.thread_state().is_escalation_handler());
            Ok(None)
        })
        .into_arc();
        let failing = testing::failing_function("work", "disk full");

        let logger = RecordingLogger::default();
        let office = Office::new("test", ProcessMetaData::new(ThreadMetaData::new()))
            .with_office_floor_escalation(
                EscalationProcedure::new().with_handler(EscalationHandler::catch_all(handler)),
            )
            .with_logger(Arc::new(logger.clone()));
        let engine = ExecutionEngine::new(office);
        let handle = engine.invoke_process(failing, None, None).unwrap();

        assert!(handle.is_complete());
        assert_eq!(recorder.entries(), vec!["floor disk full"]);
        assert!(logger.entries().is_empty());
    }

    struct LifecycleTeam {
        log: Recorder,
    }

    impl Team for LifecycleTeam {
        fn start_working(&self) {
            self.log.push("start");
        }

        fn assign_job(&self, job: Job) {
            self.log.push("job");
            job.run(&WorkerContext::new());
        }

        fn stop_working(&self) {
            self.log.push("stop");
        }
    }

    #[test]
    fn test_engine_starts_and_stops_teams() {
        let recorder = Recorder::default();
        let team = TeamManagement::new("io", Arc::new(LifecycleTeam { log: recorder.clone() }));
        let office = Office::new("test", ProcessMetaData::default()).with_team(team);
        assert!(office.team("io").is_some());
        assert!(office.team("cpu").is_none());

        let engine = ExecutionEngine::new(office);
        assert_eq!(recorder.entries(), vec!["start"]);

        let handle = engine
            .invoke_process(testing::noop_function("noop"), None, None)
            .unwrap();
        assert!(handle.is_complete());

        engine.stop();
        assert_eq!(recorder.entries(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_completion_receiver() {
        let engine = ExecutionEngine::new(Office::new("test", ProcessMetaData::default()));
        let handle = engine
            .invoke_process(testing::noop_function("noop"), None, None)
            .unwrap();

        let id = handle.completion().await.unwrap();
        assert_eq!(id, handle.id());
    }
}
