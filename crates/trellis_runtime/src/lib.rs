//! TRELLIS Runtime
//!
//! Trampolined continuation scheduler for managed functions.
//! Work is expressed as function states that return their continuation;
//! failures escalate through office, completion, office floor and log levels.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod active;
pub mod avoid;
pub mod engine;
pub mod escalation;
pub mod executor;
pub mod flow;
pub mod function;
pub mod governance;
pub mod managed_function;
pub mod managed_object;
pub mod meta;
pub mod monitor;
pub mod process;
pub mod safety;
pub mod team;
pub mod thread;
pub mod within;

mod operation;

#[cfg(test)]
mod testing;

pub use active::{ActiveThreadState, ThreadSynchroniser, ThreadSynchroniserFactory, WorkerContext};
pub use avoid::{avoid_overloaded_team, avoid_team, AvoidTeamHandle, TeamLoad};
pub use engine::{EngineConfig, ExecutionEngine, Office, ProcessHandle};
pub use escalation::{
    EscalationHandler, EscalationLevel, EscalationLogger, EscalationProcedure,
    TracingEscalationLogger,
};
pub use executor::{ExecutionContext, FunctionLoop};
pub use flow::{Flow, FlowCompletion};
pub use function::{then, FunctionState, FunctionStep};
pub use governance::{Governance, GovernanceFactory, GovernanceMetaData, GovernanceState};
pub use managed_function::{
    ManagedFunctionContext, ManagedFunctionLogic, ManagedFunctionMetaData, Parameter,
};
pub use managed_object::{
    ManagedObject, ManagedObjectIndex, ManagedObjectLookup, ManagedObjectMetaData,
    ManagedObjectScope, ManagedObjectSource, StaticManagedObjects, ValueObject,
};
pub use meta::{ProcessMetaData, ThreadMetaData};
pub use monitor::{Metrics, MetricsSnapshot};
pub use process::ProcessState;
pub use team::{BlockingTeam, BlockingTeamConfig, Job, PassiveTeam, Team, TeamManagement};
pub use thread::{
    on_escalation_complete, on_thread_complete, EscalationCompletion, ThreadCompletion,
    ThreadState,
};
pub use within::run_within;
