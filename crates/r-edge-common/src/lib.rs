//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the gateway runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the R-Edge workspace.
//! This crate exposes configuration loading, configuration hashing, and
//! logging bootstrap consumed by the daemon and the reconciler crates.

pub mod config;
pub mod logging;

pub use config::{
    hash_app_config, ApiConfig, AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, Mode,
    RawProperties, RawValue, ReconcilerConfig, SimulationConfig, TrustAnchorConfig, TrustPolicy,
};
pub use logging::{init_tracing, LogFormat};
