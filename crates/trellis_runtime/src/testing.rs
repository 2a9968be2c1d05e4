//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};
use trellis_core::{Escalation, ProcessId, ThreadStateId};

use crate::active::WorkerContext;
use crate::engine::{EngineConfig, Office};
use crate::escalation::EscalationLogger;
use crate::executor::FunctionLoop;
use crate::flow::FlowCompletion;
use crate::function::FunctionState;
use crate::governance::{Governance, GovernanceMetaData, GovernanceState};
use crate::managed_function::ManagedFunctionMetaData;
use crate::managed_object::{ManagedObject, ManagedObjectMetaData};
use crate::meta::{ProcessMetaData, ThreadMetaData};
use crate::process::ProcessState;
use crate::thread::{ThreadCompletion, ThreadState};

/// Install a test subscriber so `tracing` output shows up with `--nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// Ordered record of events shared between fixtures
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Logger capturing escalation messages
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger(Recorder);

impl RecordingLogger {
    pub fn entries(&self) -> Vec<String> {
        self.0.entries()
    }
}

impl EscalationLogger for RecordingLogger {
    fn log_escalation(&self, _process: ProcessId, _thread: ThreadStateId, escalation: &Escalation) {
        self.0.push(escalation.to_string());
    }
}

/// Managed object whose value is its name
pub struct RecordingObject {
    name: String,
    recorder: Recorder,
}

impl RecordingObject {
    pub fn meta(name: &str, recorder: &Recorder) -> ManagedObjectMetaData {
        let name = name.to_string();
        let recorder = recorder.clone();
        ManagedObjectMetaData::new(
            name.clone(),
            move || -> Result<Box<dyn ManagedObject>, Escalation> {
                recorder.push(format!("source {name}"));
                Ok(Box::new(RecordingObject {
                    name: name.clone(),
                    recorder: recorder.clone(),
                }))
            },
        )
    }
}

impl ManagedObject for RecordingObject {
    fn object(&self) -> Arc<dyn std::any::Any + Send + Sync> {
        Arc::new(self.name.clone())
    }

    fn unload(&mut self) {
        self.recorder.push(format!("unload {}", self.name));
    }
}

/// Governance recording each hook
pub struct RecordingGovernance {
    name: String,
    recorder: Recorder,
    reactivating: bool,
    fail_enforce: bool,
}

impl RecordingGovernance {
    pub fn new(name: &str, recorder: &Recorder) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            reactivating: false,
            fail_enforce: false,
        }
    }

    /// Enforcement always re-activates the governance
    pub fn reactivating(mut self) -> Self {
        self.reactivating = true;
        self
    }

    /// Enforcement escalates
    pub fn failing_enforce(mut self) -> Self {
        self.fail_enforce = true;
        self
    }

    pub fn boxed(name: &str, recorder: &Recorder) -> Box<dyn Governance> {
        Box::new(Self::new(name, recorder))
    }

    pub fn meta(name: &str, recorder: &Recorder) -> GovernanceMetaData {
        Self::meta_with(name, recorder, |g| g)
    }

    pub fn meta_with(
        name: &str,
        recorder: &Recorder,
        configure: fn(RecordingGovernance) -> RecordingGovernance,
    ) -> GovernanceMetaData {
        let name = name.to_string();
        let recorder = recorder.clone();
        GovernanceMetaData::new(name.clone(), move || -> Box<dyn Governance> {
            Box::new(configure(RecordingGovernance::new(&name, &recorder)))
        })
    }
}

impl Governance for RecordingGovernance {
    fn activate(&mut self) -> Result<(), Escalation> {
        self.recorder.push(format!("activate {}", self.name));
        Ok(())
    }

    fn enforce(&mut self) -> Result<GovernanceState, Escalation> {
        self.recorder.push(format!("enforce {}", self.name));
        if self.fail_enforce {
            return Err(Escalation::msg(format!("enforce {} failed", self.name)));
        }
        Ok(if self.reactivating {
            GovernanceState::Active
        } else {
            GovernanceState::Inactive
        })
    }

    fn disregard(&mut self) -> Result<(), Escalation> {
        self.recorder.push(format!("disregard {}", self.name));
        Ok(())
    }

    fn deactivate(&mut self) {
        self.recorder.push(format!("deactivate {}", self.name));
    }
}

/// Flow completion recording completion and cancellation
pub struct RecordingFlowCompletion {
    name: String,
    recorder: Recorder,
}

impl RecordingFlowCompletion {
    pub fn boxed(name: &str, recorder: &Recorder) -> Box<dyn FlowCompletion> {
        Box::new(Self {
            name: name.to_string(),
            recorder: recorder.clone(),
        })
    }
}

impl FlowCompletion for RecordingFlowCompletion {
    fn flow_complete(self: Box<Self>) -> Option<FunctionState> {
        self.recorder.push(format!("complete {}", self.name));
        None
    }

    fn cancel(self: Box<Self>) -> Option<FunctionState> {
        self.recorder.push(format!("cancel {}", self.name));
        None
    }
}

pub fn office_value() -> Office {
    Office::new("test", ProcessMetaData::default())
}

pub fn office() -> Arc<Office> {
    Arc::new(office_value())
}

pub fn office_with_thread_meta(thread: ThreadMetaData) -> Arc<Office> {
    Arc::new(Office::new("test", ProcessMetaData::new(thread)))
}

pub fn office_with_process_meta(process: ProcessMetaData) -> Arc<Office> {
    Arc::new(Office::new("test", process))
}

pub fn office_with_logger(logger: RecordingLogger) -> Arc<Office> {
    Arc::new(office_value().with_logger(Arc::new(logger)))
}

pub fn office_with_config(config: EngineConfig) -> Arc<Office> {
    Arc::new(office_value().with_config(config))
}

pub fn process(office: Arc<Office>) -> Arc<ProcessState> {
    ProcessState::new(office, None)
}

pub fn process_with_completion(
    office: Arc<Office>,
    completion: Box<dyn ThreadCompletion>,
) -> Arc<ProcessState> {
    ProcessState::new(office, Some(completion))
}

/// Register a thread state with no flows
pub fn spawn_idle_thread(process: &Arc<ProcessState>) -> Arc<ThreadState> {
    process.register(None, false)
}

/// Run `function` to completion on a fresh worker
pub fn run(function: FunctionState) {
    let worker = WorkerContext::new();
    FunctionLoop::new().run(&worker, function);
}

pub fn noop_function(name: &str) -> Arc<ManagedFunctionMetaData> {
    ManagedFunctionMetaData::new(name, |_| Ok(None)).into_arc()
}

pub fn failing_function(name: &str, message: &str) -> Arc<ManagedFunctionMetaData> {
    let message = message.to_string();
    ManagedFunctionMetaData::new(name, move |_| Err(Escalation::msg(message.clone()))).into_arc()
}
