//! Execution metrics.
//!
//! Counters are updated lock-free by every worker and read through
//! [`Metrics::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live execution counters
#[derive(Debug, Default)]
pub struct Metrics {
    functions_executed: AtomicU64,
    team_handoffs: AtomicU64,
    flows_created: AtomicU64,
    flows_completed: AtomicU64,
    flows_cancelled: AtomicU64,
    threads_started: AtomicU64,
    threads_completed: AtomicU64,
    processes_started: AtomicU64,
    processes_completed: AtomicU64,
    escalations: AtomicU64,
    escalations_logged: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Function states executed
    pub functions_executed: u64,
    /// Function states handed to another team
    pub team_handoffs: u64,
    /// Flows created
    pub flows_created: u64,
    /// Flows completed normally
    pub flows_completed: u64,
    /// Flows cancelled
    pub flows_cancelled: u64,
    /// Thread states started
    pub threads_started: u64,
    /// Thread states completed
    pub threads_completed: u64,
    /// Processes started
    pub processes_started: u64,
    /// Processes completed
    pub processes_completed: u64,
    /// Escalations raised
    pub escalations: u64,
    /// Escalations that reached the logger
    pub escalations_logged: u64,
}

impl MetricsSnapshot {
    /// Fraction of escalations that reached the logger (0.0 - 1.0)
    #[must_use]
    pub fn unhandled_rate(&self) -> f64 {
        if self.escalations == 0 {
            return 0.0;
        }
        self.escalations_logged as f64 / self.escalations as f64
    }

    /// Thread states started but not completed
    #[must_use]
    pub fn active_threads(&self) -> u64 {
        self.threads_started.saturating_sub(self.threads_completed)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an executed function state
    pub fn record_function_executed(&self) {
        bump(&self.functions_executed);
    }

    /// Record a hand-off to another team
    pub fn record_team_handoff(&self) {
        bump(&self.team_handoffs);
    }

    /// Record a created flow
    pub fn record_flow_created(&self) {
        bump(&self.flows_created);
    }

    /// Record a completed flow
    pub fn record_flow_completed(&self) {
        bump(&self.flows_completed);
    }

    /// Record a cancelled flow
    pub fn record_flow_cancelled(&self) {
        bump(&self.flows_cancelled);
    }

    /// Record a started thread state
    pub fn record_thread_started(&self) {
        bump(&self.threads_started);
    }

    /// Record a completed thread state
    pub fn record_thread_completed(&self) {
        bump(&self.threads_completed);
    }

    /// Record a started process
    pub fn record_process_started(&self) {
        bump(&self.processes_started);
    }

    /// Record a completed process
    pub fn record_process_completed(&self) {
        bump(&self.processes_completed);
    }

    /// Record a raised escalation
    pub fn record_escalation(&self) {
        bump(&self.escalations);
    }

    /// Record an escalation handed to the logger
    pub fn record_escalation_logged(&self) {
        bump(&self.escalations_logged);
    }

    /// Copy the current counters
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            functions_executed: load(&self.functions_executed),
            team_handoffs: load(&self.team_handoffs),
            flows_created: load(&self.flows_created),
            flows_completed: load(&self.flows_completed),
            flows_cancelled: load(&self.flows_cancelled),
            threads_started: load(&self.threads_started),
            threads_completed: load(&self.threads_completed),
            processes_started: load(&self.processes_started),
            processes_completed: load(&self.processes_completed),
            escalations: load(&self.escalations),
            escalations_logged: load(&self.escalations_logged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_counters() {
        let metrics = Metrics::new();
        metrics.record_function_executed();
        metrics.record_function_executed();
        metrics.record_thread_started();
        metrics.record_escalation();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.functions_executed, 2);
        assert_eq!(snapshot.threads_started, 1);
        assert_eq!(snapshot.active_threads(), 1);
        assert_eq!(snapshot.escalations, 1);
    }

    #[test]
    fn test_unhandled_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().unhandled_rate(), 0.0);

        metrics.record_escalation();
        metrics.record_escalation();
        metrics.record_escalation_logged();
        assert_eq!(metrics.snapshot().unhandled_rate(), 0.5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.record_process_started();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["processes_started"], 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = std::sync::Arc::new(Metrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = std::sync::Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_function_executed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().functions_executed, 4000);
    }
}
