//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the gateway runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::logging::LogFormat;

/// Raw key-value properties for a single workload, as delivered by the configuration source.
pub type RawProperties = IndexMap<String, String>;

fn default_mode() -> Mode {
    Mode::Production
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_file() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8081))
}

fn default_connect_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(5)
}

/// Primary configuration object for the gateway daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Workload name mapped to its raw configuration properties.
    #[serde(default)]
    pub workloads: IndexMap<String, IndexMap<String, RawValue>>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_EDGE_CONFIG";

    /// Load configuration from disk, respecting the `R_EDGE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Flatten every workload table into the string properties the descriptor parser expects.
    pub fn workload_properties(&self) -> IndexMap<String, RawProperties> {
        self.workloads
            .iter()
            .map(|(name, table)| {
                let properties = table
                    .iter()
                    .map(|(key, value)| (key.clone(), value.as_property()))
                    .collect();
                (name.clone(), properties)
            })
            .collect()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        for name in self.workloads.keys() {
            if name.trim().is_empty() {
                return Err(anyhow!("workload names must not be empty"));
            }
            if name.chars().any(char::is_whitespace) {
                return Err(anyhow!("workload name '{}' must not contain whitespace", name));
            }
        }
        self.reconciler.validate()?;
        if self.api.enabled && self.metrics.enabled && self.api.listen == self.metrics.listen {
            return Err(anyhow!(
                "api and metrics listeners must not share address {}",
                self.api.listen
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            api: ApiConfig::default(),
            reconciler: ReconcilerConfig::default(),
            simulation: SimulationConfig::default(),
            workloads: IndexMap::new(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Stable SHA-256 fingerprint of the effective configuration, used to detect reloads.
pub fn hash_app_config(config: &AppConfig) -> Result<String> {
    let serialised = toml::to_string(config)
        .with_context(|| "failed to serialise configuration for hashing")?;
    let mut hasher = Sha256::new();
    hasher.update(serialised.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Operating mode for the daemon.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Production,
    Simulation,
}

impl Mode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, Mode::Simulation)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Mode::Production),
            "simulation" => Ok(Mode::Simulation),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// A single raw configuration value. TOML scalars and arrays are accepted and
/// normalised into the string form the configuration source contract uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<RawValue>),
}

impl RawValue {
    /// Render the value as a property string; arrays become comma-separated lists.
    pub fn as_property(&self) -> String {
        match self {
            RawValue::Bool(value) => value.to_string(),
            RawValue::Integer(value) => value.to_string(),
            RawValue::Float(value) => value.to_string(),
            RawValue::Text(value) => value.clone(),
            RawValue::List(values) => values
                .iter()
                .map(RawValue::as_property)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// How the host treats a negative image trust verdict.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustPolicy {
    /// Log the verdict and launch anyway.
    #[default]
    Advisory,
    /// Deliver the workload disabled unless the image verified successfully.
    Enforce,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Cadence of the backend health signal delivered to every reconciler.
    #[serde(default = "default_connect_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_interval: Duration,
    /// How often the daemon re-reads its configuration file.
    #[serde(default = "default_reload_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reload_interval: Duration,
    #[serde(default)]
    pub trust_policy: TrustPolicy,
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_interval.is_zero() {
            return Err(anyhow!("reconciler.connect_interval must be greater than zero"));
        }
        if self.reload_interval.is_zero() {
            return Err(anyhow!("reconciler.reload_interval must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            connect_interval: default_connect_interval(),
            reload_interval: default_reload_interval(),
            trust_policy: TrustPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when neither `R_EDGE_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Write a rolling JSON file next to console output.
    #[serde(default = "default_log_file")]
    pub file: bool,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: default_log_format(),
            file: default_log_file(),
            directory: default_logging_directory(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

/// Settings for the in-memory backend and trust validator used in simulation mode.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Artificial latency applied to every simulated start call.
    #[serde(default, rename = "start_latency_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub start_latency: Duration,
    /// Workload name mapped to the number of initial start calls that should fail.
    #[serde(default)]
    pub failing_starts: IndexMap<String, u32>,
    /// Workloads reported as already running when the daemon starts.
    #[serde(default)]
    pub preexisting: Vec<String>,
    /// Trust anchor name mapped to its allowlist.
    #[serde(default)]
    pub trust_anchors: IndexMap<String, TrustAnchorConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    /// `image:tag` reference mapped to its pinned `sha256:` digest.
    #[serde(default)]
    pub allowed: IndexMap<String, String>,
}
