//! Static configuration of threads and processes.

use std::fmt;
use std::sync::Arc;

use crate::active::ThreadSynchroniserFactory;
use crate::escalation::EscalationProcedure;
use crate::governance::GovernanceMetaData;
use crate::managed_object::ManagedObjectMetaData;

/// Configuration shared by every thread state of an office
#[derive(Clone, Default)]
pub struct ThreadMetaData {
    managed_objects: Vec<ManagedObjectMetaData>,
    governance: Vec<GovernanceMetaData>,
    escalation_procedure: EscalationProcedure,
    synchronisers: Vec<Arc<dyn ThreadSynchroniserFactory>>,
}

impl ThreadMetaData {
    /// Empty metadata
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a thread scoped managed object
    #[must_use]
    pub fn with_managed_object(mut self, meta: ManagedObjectMetaData) -> Self {
        self.managed_objects.push(meta);
        self
    }

    /// Append a governance
    #[must_use]
    pub fn with_governance(mut self, meta: GovernanceMetaData) -> Self {
        self.governance.push(meta);
        self
    }

    /// Set the office escalation procedure
    #[must_use]
    pub fn with_escalation_procedure(mut self, procedure: EscalationProcedure) -> Self {
        self.escalation_procedure = procedure;
        self
    }

    /// Append a thread synchroniser factory
    #[must_use]
    pub fn with_synchroniser(mut self, factory: Arc<dyn ThreadSynchroniserFactory>) -> Self {
        self.synchronisers.push(factory);
        self
    }

    /// Thread scoped managed objects
    #[must_use]
    pub fn managed_objects(&self) -> &[ManagedObjectMetaData] {
        &self.managed_objects
    }

    /// Governance configuration
    #[must_use]
    pub fn governance(&self) -> &[GovernanceMetaData] {
        &self.governance
    }

    /// Office escalation procedure
    #[must_use]
    pub fn escalation_procedure(&self) -> &EscalationProcedure {
        &self.escalation_procedure
    }

    /// Thread synchroniser factories
    #[must_use]
    pub fn synchronisers(&self) -> &[Arc<dyn ThreadSynchroniserFactory>] {
        &self.synchronisers
    }
}

impl fmt::Debug for ThreadMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadMetaData")
            .field("managed_objects", &self.managed_objects)
            .field("governance", &self.governance)
            .field("escalation_procedure", &self.escalation_procedure)
            .field("synchronisers", &self.synchronisers.len())
            .finish()
    }
}

/// Configuration of processes
#[derive(Debug, Clone, Default)]
pub struct ProcessMetaData {
    managed_objects: Vec<ManagedObjectMetaData>,
    thread: Arc<ThreadMetaData>,
}

impl ProcessMetaData {
    /// Process metadata using `thread` for every thread state
    #[must_use]
    pub fn new(thread: ThreadMetaData) -> Self {
        Self {
            managed_objects: Vec::new(),
            thread: Arc::new(thread),
        }
    }

    /// Append a process scoped managed object
    #[must_use]
    pub fn with_managed_object(mut self, meta: ManagedObjectMetaData) -> Self {
        self.managed_objects.push(meta);
        self
    }

    /// Process scoped managed objects
    #[must_use]
    pub fn managed_objects(&self) -> &[ManagedObjectMetaData] {
        &self.managed_objects
    }

    /// Thread metadata
    #[must_use]
    pub fn thread(&self) -> &Arc<ThreadMetaData> {
        &self.thread
    }
}
