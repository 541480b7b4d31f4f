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

use async_trait::async_trait;
use r_edge_workload::WorkloadDescriptor;
use serde::Serialize;
use thiserror::Error;

/// Opaque reference to a workload instance known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkloadHandle {
    /// Backend-assigned instance identifier.
    pub id: String,
    /// Workload identity the instance runs under.
    pub name: String,
}

impl WorkloadHandle {
    /// Construct a handle.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Failures reported by an [`OrchestrationBackend`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("orchestration backend unavailable: {0}")]
    Unavailable(String),
    /// The backend refused or failed to start the workload.
    #[error("failed to start workload `{workload}`: {reason}")]
    StartFailed {
        /// Workload identity.
        workload: String,
        /// Backend supplied reason.
        reason: String,
    },
    /// The referenced instance does not exist.
    #[error("workload instance `{0}` not found")]
    NotFound(String),
    /// Any other failed operation.
    #[error("{operation} failed for `{id}`: {reason}")]
    OperationFailed {
        /// Operation name (`stop`, `delete`).
        operation: &'static str,
        /// Instance identifier.
        id: String,
        /// Backend supplied reason.
        reason: String,
    },
}

/// Imperative operations offered by the system that actually runs workloads.
///
/// Calls may block for as long as the backend needs; the reconciler only issues
/// them from its own serialised task or from a start attempt task.
#[async_trait]
pub trait OrchestrationBackend: Send + Sync + fmt::Debug {
    /// Create and start an instance for `descriptor`.
    async fn start(&self, descriptor: &WorkloadDescriptor) -> Result<WorkloadHandle, BackendError>;

    /// Stop a running instance.
    async fn stop(&self, handle: &WorkloadHandle) -> Result<(), BackendError>;

    /// Remove a stopped instance.
    async fn delete(&self, handle: &WorkloadHandle) -> Result<(), BackendError>;

    /// Every instance currently known to the backend.
    async fn list_existing(&self) -> Result<Vec<WorkloadHandle>, BackendError>;
}

/// Look up an existing instance running under `name`.
pub async fn find_existing(
    backend: &dyn OrchestrationBackend,
    name: &str,
) -> Result<Option<WorkloadHandle>, BackendError> {
    let existing = backend.list_existing().await?;
    Ok(existing.into_iter().find(|handle| handle.name == name))
}
