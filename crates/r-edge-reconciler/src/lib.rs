//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload lifecycle reconciliation against an orchestration backend."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Keeps externally orchestrated workloads converged with their declared
//! [`WorkloadDescriptor`](r_edge_workload::WorkloadDescriptor).
//!
//! Each workload identity gets one [`Reconciler`] state machine, driven by one
//! [`ReconcilerHost`] task that serialises every event for that identity. Start
//! attempts run off that task, one after another, through the [`RetryScheduler`]
//! and report back over a channel, so configuration delivery never waits on the
//! backend.
#![warn(missing_docs)]

pub mod backend;
pub mod fleet;
pub mod host;
pub mod metrics;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod trust;

pub use backend::{find_existing, BackendError, OrchestrationBackend, WorkloadHandle};
pub use fleet::{FleetChanges, StatusBoard, WorkloadFleet};
pub use host::{HostError, HostOptions, ReconcilerHost};
pub use metrics::ReconcilerMetrics;
pub use reconciler::Reconciler;
pub use retry::{AttemptHandle, AttemptReport, RetryScheduler};
pub use state::{
    LifecycleState, LifecycleStateKind, ReconcilerEvent, StateTransition, WorkloadStatus,
};
pub use trust::{evaluate, TrustError, TrustRequest, TrustValidator, TrustVerdict, ValidationOutcome};
