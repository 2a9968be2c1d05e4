//! TRELLIS Core Types
//!
//! Identifiers, errors and the escalation carrier shared by the runtime.
//! This crate has no scheduling logic.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod escalation;
pub mod id;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use escalation::{Escalation, MessageEscalation, Panicked};
pub use id::{FlowId, ProcessId, TeamId, ThreadStateId, WorkerId};
