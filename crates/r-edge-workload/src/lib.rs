//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload descriptors describing the desired state of a container."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Workload descriptors for the R-Edge reconciler.
//!
//! A [`WorkloadDescriptor`] is the immutable desired state of one workload. It is
//! built either programmatically through [`WorkloadDescriptorBuilder`] or from the
//! raw key-value properties delivered by a configuration source via
//! [`parse_descriptor`]. Both paths apply the same defaults, so descriptor
//! equality is a reliable "nothing changed" check.
#![warn(missing_docs)]

pub mod descriptor;
pub mod error;
pub mod keys;
pub mod parse;

pub use descriptor::{
    GpuRequest, NetworkMode, PortMapping, PortProtocol, RegistryCredentials, ResourceLimits,
    RetryPolicy, VolumeMount, WorkloadDescriptor, WorkloadDescriptorBuilder,
};
pub use error::{DescriptorError, WorkloadConfigError};
pub use parse::{parse_descriptor, parse_workloads};
