//! Escalation procedures, levels and the terminal logger.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tracing::error;
use trellis_core::{Escalation, ProcessId, ThreadStateId};

use crate::managed_function::ManagedFunctionMetaData;

/// How far escalation handling of a thread state has progressed.
///
/// Levels only ever increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EscalationLevel {
    /// Office escalation procedure of the thread
    Office,
    /// Thread completion callback
    FlowCompletion,
    /// Runtime-wide escalation procedure
    OfficeFloor,
    /// Escalation logger
    Log,
}

impl EscalationLevel {
    /// Level consulted after this one declines
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Office => Self::FlowCompletion,
            Self::FlowCompletion => Self::OfficeFloor,
            Self::OfficeFloor | Self::Log => Self::Log,
        }
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Office => "office",
            Self::FlowCompletion => "flow-completion",
            Self::OfficeFloor => "office-floor",
            Self::Log => "log",
        };
        f.write_str(name)
    }
}

type Matcher = Arc<dyn Fn(&Escalation) -> bool + Send + Sync>;

/// Handler function selected for matching escalations
#[derive(Clone)]
pub struct EscalationHandler {
    name: String,
    matcher: Matcher,
    function: Arc<ManagedFunctionMetaData>,
}

impl EscalationHandler {
    /// Handle escalations wrapping an error of type `E`
    #[must_use]
    pub fn for_type<E>(function: Arc<ManagedFunctionMetaData>) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            name: std::any::type_name::<E>().to_string(),
            matcher: Arc::new(|escalation: &Escalation| escalation.is::<E>()),
            function,
        }
    }

    /// Handle every escalation
    #[must_use]
    pub fn catch_all(function: Arc<ManagedFunctionMetaData>) -> Self {
        Self {
            name: "*".to_string(),
            matcher: Arc::new(|_: &Escalation| true),
            function,
        }
    }

    /// Handle escalations accepted by `matcher`
    pub fn matching<M>(
        name: impl Into<String>,
        matcher: M,
        function: Arc<ManagedFunctionMetaData>,
    ) -> Self
    where
        M: Fn(&Escalation) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matcher: Arc::new(matcher),
            function,
        }
    }

    /// Handler name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handler accepts `escalation`
    #[must_use]
    pub fn handles(&self, escalation: &Escalation) -> bool {
        (self.matcher)(escalation)
    }

    /// Function executed to handle the escalation
    #[must_use]
    pub fn function(&self) -> &Arc<ManagedFunctionMetaData> {
        &self.function
    }
}

impl fmt::Debug for EscalationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationHandler")
            .field("name", &self.name)
            .field("function", &self.function.name())
            .finish()
    }
}

/// Ordered escalation handlers. The first matching handler wins.
#[derive(Debug, Clone, Default)]
pub struct EscalationProcedure {
    handlers: Vec<EscalationHandler>,
}

impl EscalationProcedure {
    /// Procedure with no handlers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler
    #[must_use]
    pub fn with_handler(mut self, handler: EscalationHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// First handler accepting `escalation`
    #[must_use]
    pub fn find(&self, escalation: &Escalation) -> Option<&EscalationHandler> {
        self.handlers.iter().find(|h| h.handles(escalation))
    }

    /// Whether there are no handlers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Terminal sink for escalations no level handled
pub trait EscalationLogger: Send + Sync {
    /// Record an unhandled escalation
    fn log_escalation(&self, process: ProcessId, thread: ThreadStateId, escalation: &Escalation);
}

/// Logs unhandled escalations through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEscalationLogger;

impl EscalationLogger for TracingEscalationLogger {
    fn log_escalation(&self, process: ProcessId, thread: ThreadStateId, escalation: &Escalation) {
        error!(
            process = %process,
            thread = %thread,
            escalation = %escalation,
            "Unhandled escalation"
        );
    }
}
