//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload lifecycle reconciliation against an orchestration backend."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use r_edge_workload::WorkloadDescriptor;
use serde::Serialize;

use crate::backend::WorkloadHandle;
use crate::retry::{AttemptHandle, AttemptReport};

/// Lifecycle state of one workload identity.
///
/// Each variant owns exactly what it needs: `Starting` owns the in-flight
/// attempt, `Created` owns the backend handle.
#[derive(Debug)]
pub enum LifecycleState {
    /// Nothing is known to be running.
    Disabled {
        /// Last accepted descriptor, `None` before the first update.
        descriptor: Option<Arc<WorkloadDescriptor>>,
    },
    /// A start attempt loop is in flight.
    Starting {
        /// Descriptor being started.
        descriptor: Arc<WorkloadDescriptor>,
        /// The single live attempt.
        attempt: AttemptHandle,
    },
    /// The workload is running under `handle`.
    Created {
        /// Descriptor the instance was started from.
        descriptor: Arc<WorkloadDescriptor>,
        /// Backend handle.
        handle: WorkloadHandle,
    },
}

impl LifecycleState {
    /// Initial state of a fresh reconciler.
    pub fn initial() -> Self {
        LifecycleState::Disabled { descriptor: None }
    }

    /// Variant without payload.
    pub fn kind(&self) -> LifecycleStateKind {
        match self {
            LifecycleState::Disabled { .. } => LifecycleStateKind::Disabled,
            LifecycleState::Starting { .. } => LifecycleStateKind::Starting,
            LifecycleState::Created { .. } => LifecycleStateKind::Created,
        }
    }

    /// Descriptor currently associated with the state.
    pub fn descriptor(&self) -> Option<&Arc<WorkloadDescriptor>> {
        match self {
            LifecycleState::Disabled { descriptor } => descriptor.as_ref(),
            LifecycleState::Starting { descriptor, .. }
            | LifecycleState::Created { descriptor, .. } => Some(descriptor),
        }
    }

    /// Backend handle, only present in `Created`.
    pub fn handle(&self) -> Option<&WorkloadHandle> {
        match self {
            LifecycleState::Created { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

/// Externally visible state, as served to health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStateKind {
    /// See [`LifecycleState::Disabled`].
    Disabled,
    /// See [`LifecycleState::Starting`].
    Starting,
    /// See [`LifecycleState::Created`].
    Created,
}

impl LifecycleStateKind {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStateKind::Disabled => "disabled",
            LifecycleStateKind::Starting => "starting",
            LifecycleStateKind::Created => "created",
        }
    }

    /// Numeric encoding used by the state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            LifecycleStateKind::Disabled => 0,
            LifecycleStateKind::Starting => 1,
            LifecycleStateKind::Created => 2,
        }
    }
}

impl fmt::Display for LifecycleStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerEvent {
    /// A new desired state was delivered.
    ConfigurationUpdated(Arc<WorkloadDescriptor>),
    /// Periodic backend health signal.
    Connect,
    /// The attempt of `generation` started the workload.
    ContainerReady {
        /// Attempt generation.
        generation: u64,
        /// Handle of the started instance.
        handle: WorkloadHandle,
    },
    /// The attempt of `generation` had a failed start call.
    AttemptFailed {
        /// Attempt generation.
        generation: u64,
        /// Failed calls so far.
        attempt: u32,
    },
    /// The attempt of `generation` exhausted its budget.
    StartupFailure {
        /// Attempt generation.
        generation: u64,
        /// Start calls made.
        attempts: u32,
    },
    /// Forced shutdown of the workload.
    Disabled,
}

impl ReconcilerEvent {
    /// Short label used in logs and transition records.
    pub fn cause(&self) -> &'static str {
        match self {
            ReconcilerEvent::ConfigurationUpdated(_) => "configuration-updated",
            ReconcilerEvent::Connect => "connect",
            ReconcilerEvent::ContainerReady { .. } => "container-ready",
            ReconcilerEvent::AttemptFailed { .. } => "attempt-failed",
            ReconcilerEvent::StartupFailure { .. } => "startup-failure",
            ReconcilerEvent::Disabled => "disabled",
        }
    }
}

impl From<AttemptReport> for ReconcilerEvent {
    fn from(report: AttemptReport) -> Self {
        match report {
            AttemptReport::Ready {
                generation, handle, ..
            } => ReconcilerEvent::ContainerReady { generation, handle },
            AttemptReport::AttemptFailed {
                generation,
                attempt,
            } => ReconcilerEvent::AttemptFailed {
                generation,
                attempt,
            },
            AttemptReport::Exhausted {
                generation,
                attempts,
            } => ReconcilerEvent::StartupFailure {
                generation,
                attempts,
            },
        }
    }
}

/// Snapshot of a reconciler published for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadStatus {
    /// Workload identity.
    pub name: String,
    /// Current state.
    pub state: LifecycleStateKind,
    /// Whether the accepted descriptor asks for the workload to run.
    pub enabled: bool,
    /// `image:tag` of the accepted descriptor.
    pub image: Option<String>,
    /// Handle of the running instance.
    pub handle: Option<WorkloadHandle>,
    /// Generation of the latest start attempt.
    pub generation: u64,
    /// Failed start calls of the latest attempt.
    pub failed_attempts: u32,
    /// The latest attempt exhausted its retry budget.
    pub startup_failed: bool,
}

impl WorkloadStatus {
    /// Status of a reconciler that has not received anything yet.
    pub fn initial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: LifecycleStateKind::Disabled,
            enabled: false,
            image: None,
            handle: None,
            generation: 0,
            failed_attempts: 0,
            startup_failed: false,
        }
    }
}

/// A change of [`WorkloadStatus`] caused by one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// State before the event.
    pub from: LifecycleStateKind,
    /// State after the event.
    pub to: LifecycleStateKind,
    /// [`ReconcilerEvent::cause`] of the triggering event.
    pub cause: &'static str,
    /// Status after the event.
    pub status: WorkloadStatus,
}
