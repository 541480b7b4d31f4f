//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload lifecycle reconciliation against an orchestration backend."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use r_edge_metrics::SharedRegistry;

use crate::state::LifecycleStateKind;

/// Metrics published by reconcilers and their start attempts.
#[derive(Clone)]
pub struct ReconcilerMetrics {
    registry: SharedRegistry,
    transitions_total: IntCounterVec,
    start_attempts_total: IntCounterVec,
    startup_failures_total: IntCounterVec,
    state: IntGaugeVec,
}

impl ReconcilerMetrics {
    /// Register the reconciler metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let transitions_total = IntCounterVec::new(
            Opts::new(
                "r_edge_reconciler_transitions_total",
                "Lifecycle state transitions per workload",
            ),
            &["workload", "from", "to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let start_attempts_total = IntCounterVec::new(
            Opts::new(
                "r_edge_reconciler_start_attempts_total",
                "Backend start calls issued by retry attempts",
            ),
            &["workload", "outcome"],
        )?;
        registry.register(Box::new(start_attempts_total.clone()))?;

        let startup_failures_total = IntCounterVec::new(
            Opts::new(
                "r_edge_reconciler_startup_failures_total",
                "Start attempts that exhausted their retry budget",
            ),
            &["workload"],
        )?;
        registry.register(Box::new(startup_failures_total.clone()))?;

        let state = IntGaugeVec::new(
            Opts::new(
                "r_edge_reconciler_state",
                "Current lifecycle state (0 disabled, 1 starting, 2 created)",
            ),
            &["workload"],
        )?;
        registry.register(Box::new(state.clone()))?;

        Ok(Self {
            registry,
            transitions_total,
            start_attempts_total,
            startup_failures_total,
            state,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count a transition and publish the new state.
    pub fn record_transition(
        &self,
        workload: &str,
        from: LifecycleStateKind,
        to: LifecycleStateKind,
    ) {
        self.transitions_total
            .with_label_values(&[workload, from.as_str(), to.as_str()])
            .inc();
        self.set_state(workload, to);
    }

    /// Publish the current state without counting a transition.
    pub fn set_state(&self, workload: &str, state: LifecycleStateKind) {
        self.state
            .with_label_values(&[workload])
            .set(state.as_gauge());
    }

    /// Count one backend start call.
    pub fn record_start_attempt(&self, workload: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.start_attempts_total
            .with_label_values(&[workload, outcome])
            .inc();
    }

    /// Count an exhausted retry budget.
    pub fn record_startup_failure(&self, workload: &str) {
        self.startup_failures_total
            .with_label_values(&[workload])
            .inc();
    }
}

impl std::fmt::Debug for ReconcilerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerMetrics").finish_non_exhaustive()
    }
}
