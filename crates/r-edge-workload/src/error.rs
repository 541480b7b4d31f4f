//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload descriptors describing the desired state of a container."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

/// Errors raised while turning raw configuration into a [`crate::WorkloadDescriptor`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DescriptorError {
    /// The workload identity was blank.
    #[error("workload name must not be empty")]
    EmptyName,
    /// A required key was absent or blank.
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),
    /// A key carried a value that could not be interpreted.
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// Raw value as delivered.
        value: String,
        /// Human readable explanation.
        reason: String,
    },
    /// Internal and external port lists were not the same length.
    #[error("{internal} internal ports declared but {external} external ports")]
    PortCountMismatch {
        /// Number of internal ports.
        internal: usize,
        /// Number of external ports.
        external: usize,
    },
    /// More protocols than ports were declared.
    #[error("{protocols} port protocols declared for {ports} ports")]
    ProtocolCountMismatch {
        /// Number of protocol entries.
        protocols: usize,
        /// Number of ports.
        ports: usize,
    },
    /// Only one half of the registry credentials was supplied.
    #[error("registry credentials require both username and password")]
    IncompleteCredentials,
}

impl DescriptorError {
    pub(crate) fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A [`DescriptorError`] attributed to the workload whose configuration produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("workload `{workload}`: {source}")]
pub struct WorkloadConfigError {
    /// Workload name.
    pub workload: String,
    /// Underlying parse failure.
    #[source]
    pub source: DescriptorError,
}
