//! Team avoidance for overloaded teams.
//!
//! [`TeamLoad`] tracks in-flight jobs of a team against a threshold.
//! [`avoid_team`] wraps a function so that, while the returned handle is
//! avoiding, the function reports no responsible team when that team would
//! otherwise be chosen, and runs on whichever team is already executing it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use trellis_core::{Escalation, TeamId};

use crate::executor::ExecutionContext;
use crate::function::FunctionState;
use crate::team::TeamManagement;
use crate::thread::{EscalationCompletion, ThreadState};

/// In-flight job accounting for a team
#[derive(Debug)]
pub struct TeamLoad {
    /// Jobs considered full capacity
    max_in_flight: usize,
    /// Avoidance threshold (0.0 - 1.0)
    threshold: f64,
    in_flight: AtomicUsize,
}

impl TeamLoad {
    /// Create load accounting
    #[must_use]
    pub fn new(max_in_flight: usize, threshold: f64) -> Self {
        Self {
            max_in_flight,
            threshold: threshold.clamp(0.0, 1.0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Record a job handed to the team
    pub fn job_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a finished job
    pub fn job_finished(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Jobs currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fill ratio (0.0 - 1.0)
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        if self.max_in_flight == 0 {
            return 0.0;
        }
        (self.in_flight() as f64 / self.max_in_flight as f64).min(1.0)
    }

    /// Whether work should avoid the team
    #[must_use]
    pub fn should_avoid(&self) -> bool {
        if self.max_in_flight == 0 {
            return false;
        }
        self.in_flight() as f64 / self.max_in_flight as f64 >= self.threshold
    }
}

impl Default for TeamLoad {
    fn default() -> Self {
        Self::new(1000, 0.8)
    }
}

#[derive(Debug)]
struct AvoidTeamMarker {
    team: TeamId,
    avoiding: AtomicBool,
}

/// Controls an [`avoid_team`] wrapper
#[derive(Debug, Clone)]
pub struct AvoidTeamHandle {
    marker: Arc<AvoidTeamMarker>,
}

impl AvoidTeamHandle {
    /// Team being avoided
    #[must_use]
    pub fn team(&self) -> TeamId {
        self.marker.team
    }

    /// Whether the wrapper is still avoiding
    #[must_use]
    pub fn is_avoiding(&self) -> bool {
        self.marker.avoiding.load(Ordering::Acquire)
    }

    /// Stop avoiding. Continuations produced afterwards are no longer wrapped.
    pub fn stop_avoiding_team(&self) {
        self.marker.avoiding.store(false, Ordering::Release);
    }
}

/// Wrapper hiding a responsible team while avoiding it
pub struct AvoidTeam {
    inner: Box<FunctionState>,
    marker: Arc<AvoidTeamMarker>,
}

/// Wrap `function` so that it avoids `team` until the handle stops avoiding
#[must_use]
pub fn avoid_team(function: FunctionState, team: TeamId) -> (FunctionState, AvoidTeamHandle) {
    let marker = Arc::new(AvoidTeamMarker {
        team,
        avoiding: AtomicBool::new(true),
    });
    let handle = AvoidTeamHandle {
        marker: Arc::clone(&marker),
    };
    let function = FunctionState::AvoidTeam(AvoidTeam {
        inner: Box::new(function),
        marker,
    });
    (function, handle)
}

/// Avoid the function's responsible team when that team is overloaded
#[must_use]
pub fn avoid_overloaded_team(function: FunctionState) -> (FunctionState, Option<AvoidTeamHandle>) {
    match function.responsible_team() {
        Some(team) if team.is_overloaded() => {
            debug!(team = %team.name(), "avoiding overloaded team");
            let (function, handle) = avoid_team(function, team.id());
            (function, Some(handle))
        }
        _ => (function, None),
    }
}

impl AvoidTeam {
    fn is_avoiding(&self) -> bool {
        self.marker.avoiding.load(Ordering::Acquire)
    }

    fn rewrap(&self, next: Option<FunctionState>) -> Option<FunctionState> {
        next.map(|function| {
            if self.is_avoiding() {
                FunctionState::AvoidTeam(AvoidTeam {
                    inner: Box::new(function),
                    marker: Arc::clone(&self.marker),
                })
            } else {
                function
            }
        })
    }

    pub(crate) fn inner(&self) -> &FunctionState {
        &self.inner
    }

    pub(crate) fn thread_state(&self) -> &Arc<ThreadState> {
        self.inner.thread_state()
    }

    pub(crate) fn responsible_team(&self) -> Option<TeamManagement> {
        match self.inner.responsible_team() {
            Some(team) if self.is_avoiding() && team.id() == self.marker.team => None,
            other => other,
        }
    }

    pub(crate) fn requires_thread_state_safety(&self) -> bool {
        self.inner.requires_thread_state_safety()
    }

    pub(crate) fn execute(
        &mut self,
        context: &ExecutionContext<'_>,
    ) -> Result<Option<FunctionState>, Escalation> {
        let next = self.inner.execute(context)?;
        Ok(self.rewrap(next))
    }

    pub(crate) fn handle_escalation(
        &mut self,
        escalation: Escalation,
        completion: Option<Box<dyn EscalationCompletion>>,
    ) -> Option<FunctionState> {
        let next = self.inner.handle_escalation(escalation, completion);
        self.rewrap(next)
    }

    pub(crate) fn cancel(&mut self) -> Option<FunctionState> {
        let next = self.inner.cancel();
        self.rewrap(next)
    }
}
