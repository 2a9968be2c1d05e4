//! Governance - transactional policies scoped to a thread state.
//!
//! A governance is activated by the first function requiring it. When the
//! thread's last flow completes, active governance is enforced before the
//! thread completes; on escalation it is disregarded instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use trellis_core::Escalation;

/// Activation state of a governance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GovernanceState {
    /// Not active
    Inactive,
    /// Active and awaiting enforcement
    Active,
}

/// Policy hooks of a governance
pub trait Governance: Send {
    /// Begin governing
    ///
    /// # Errors
    ///
    /// Returns the escalation raised while activating.
    fn activate(&mut self) -> Result<(), Escalation>;

    /// Enforce the governance. Returning [`GovernanceState::Active`] means the
    /// governance re-activated and must be enforced again.
    ///
    /// # Errors
    ///
    /// Returns the escalation raised while enforcing.
    fn enforce(&mut self) -> Result<GovernanceState, Escalation>;

    /// Abandon the governance without enforcing
    ///
    /// # Errors
    ///
    /// Returns the escalation raised while disregarding.
    fn disregard(&mut self) -> Result<(), Escalation> {
        Ok(())
    }

    /// Release the governance when its thread completes
    fn deactivate(&mut self) {}
}

/// Creates a governance instance per thread state
pub trait GovernanceFactory: Send + Sync {
    /// Create an instance
    fn create(&self) -> Box<dyn Governance>;
}

impl<F> GovernanceFactory for F
where
    F: Fn() -> Box<dyn Governance> + Send + Sync,
{
    fn create(&self) -> Box<dyn Governance> {
        self()
    }
}

/// Configuration of a governance
#[derive(Clone)]
pub struct GovernanceMetaData {
    name: String,
    factory: Arc<dyn GovernanceFactory>,
}

impl GovernanceMetaData {
    /// Create metadata
    pub fn new(name: impl Into<String>, factory: impl GovernanceFactory + 'static) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }

    /// Governance name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn create(&self) -> Box<dyn Governance> {
        self.factory.create()
    }
}

impl fmt::Debug for GovernanceMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceMetaData")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Governance slot of a thread state
pub struct GovernanceContainer {
    index: usize,
    governance: Box<dyn Governance>,
    state: GovernanceState,
}

impl GovernanceContainer {
    /// Wrap an inactive governance
    #[must_use]
    pub fn new(index: usize, governance: Box<dyn Governance>) -> Self {
        Self {
            index,
            governance,
            state: GovernanceState::Inactive,
        }
    }

    /// Index within the thread's governance metadata
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> GovernanceState {
        self.state
    }

    /// Whether the governance is active
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == GovernanceState::Active
    }

    /// Activate if not already active
    ///
    /// # Errors
    ///
    /// Returns the escalation raised by the governance.
    pub fn activate(&mut self) -> Result<(), Escalation> {
        if self.is_active() {
            return Ok(());
        }
        self.governance.activate()?;
        self.state = GovernanceState::Active;
        Ok(())
    }

    /// Enforce if active
    ///
    /// # Errors
    ///
    /// Returns the escalation raised by the governance.
    pub fn enforce(&mut self) -> Result<(), Escalation> {
        if !self.is_active() {
            return Ok(());
        }
        self.state = self.governance.enforce()?;
        Ok(())
    }

    /// Disregard if active
    ///
    /// # Errors
    ///
    /// Returns the escalation raised by the governance.
    pub fn disregard(&mut self) -> Result<(), Escalation> {
        if !self.is_active() {
            return Ok(());
        }
        self.state = GovernanceState::Inactive;
        self.governance.disregard()
    }

    /// Deactivate on thread completion
    pub fn deactivate(&mut self) {
        self.governance.deactivate();
        self.state = GovernanceState::Inactive;
    }
}

impl fmt::Debug for GovernanceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceContainer")
            .field("index", &self.index)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
