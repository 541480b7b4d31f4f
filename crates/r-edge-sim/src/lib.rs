//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation runtime module exports and shared types."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! In-memory collaborators for running the reconciler without a container runtime.
//!
//! [`SimulatedBackend`] stands in for the orchestration backend and records every
//! call it receives. [`AllowlistValidator`] answers trust queries from a static
//! allowlist of pinned digests.

pub mod backend;
pub mod validator;

pub use backend::{BackendCall, SimulatedBackend, SimulatedWorkload, CALL_LOG_CAPACITY};
pub use validator::AllowlistValidator;
