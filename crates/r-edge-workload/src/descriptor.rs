//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload descriptors describing the desired state of a container."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};

/// Tag applied when the configuration omits one.
pub const DEFAULT_TAG: &str = "latest";
/// Delay between start attempts when the configuration omits one.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// TCP, the default.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl PortProtocol {
    /// Lowercase protocol label.
    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortMapping {
    /// Port inside the workload.
    pub internal: u16,
    /// Port on the gateway host.
    pub external: u16,
    /// Transport protocol.
    pub protocol: PortProtocol,
}

/// Bind mount from the host into the workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VolumeMount {
    /// Host path.
    pub host: String,
    /// Path inside the workload.
    pub container: String,
}

/// Network attachment of the workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Default bridge network.
    #[default]
    Bridge,
    /// Share the host network namespace.
    Host,
    /// No networking.
    None,
    /// A user-defined network.
    Named(String),
}

impl NetworkMode {
    /// Interpret a configured network mode; unknown names select a user-defined network.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "bridge" | "default" => NetworkMode::Bridge,
            "host" => NetworkMode::Host,
            "none" => NetworkMode::None,
            _ => NetworkMode::Named(value.trim().to_owned()),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Bridge => f.write_str("bridge"),
            NetworkMode::Host => f.write_str("host"),
            NetworkMode::None => f.write_str("none"),
            NetworkMode::Named(name) => f.write_str(name),
        }
    }
}

/// GPU devices requested by the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuRequest {
    /// No GPU access.
    #[default]
    None,
    /// Every GPU on the host.
    All,
    /// A fixed number of GPUs.
    Count(u32),
}

/// Resource ceilings applied by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU limit in thousandths of a CPU, so equality stays exact.
    pub millicpus: Option<u32>,
    /// GPU request.
    pub gpus: GpuRequest,
    /// Alternative runtime name (e.g. `nvidia`).
    pub runtime: Option<String>,
}

/// Start retry budget for a workload.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RetryPolicy {
    max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    retry_interval: Duration,
}

impl RetryPolicy {
    /// Bounded policy; `max_retries == 0` means unlimited.
    pub fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries,
            retry_interval,
        }
    }

    /// Retry forever with the given delay.
    pub fn unlimited(retry_interval: Duration) -> Self {
        Self::new(0, retry_interval)
    }

    /// Configured attempt budget, `0` when unlimited.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay between consecutive attempts.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Whether the budget is unbounded.
    pub fn is_unlimited(&self) -> bool {
        self.max_retries == 0
    }

    /// Whether another attempt may run after `attempts` have already been made.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.is_unlimited() || attempts < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited(DEFAULT_RETRY_INTERVAL)
    }
}

/// Registry credentials forwarded to the trust validator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RegistryCredentials {
    /// Registry user.
    pub username: String,
    /// Registry password or token.
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable desired state of a single workload.
///
/// Equality and hashing cover every field that affects the running workload;
/// two equal descriptors never cause a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkloadDescriptor {
    name: String,
    enabled: bool,
    image: String,
    tag: String,
    ports: Vec<PortMapping>,
    environment: BTreeMap<String, String>,
    volumes: Vec<VolumeMount>,
    devices: Vec<String>,
    privileged: bool,
    network_mode: NetworkMode,
    entrypoint: Vec<String>,
    restart_on_failure: bool,
    limits: ResourceLimits,
    trust_anchor: Option<String>,
    verify_transparency_log: bool,
    #[serde(skip)]
    credentials: Option<RegistryCredentials>,
    retry: RetryPolicy,
}

impl WorkloadDescriptor {
    /// Start building a descriptor with every optional field at its default.
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> WorkloadDescriptorBuilder {
        WorkloadDescriptorBuilder::new(name, image)
    }

    /// Stable workload identity used as the reconciliation key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the workload should be running.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Image repository.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Image tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `image:tag` reference.
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Published ports.
    pub fn ports(&self) -> &[PortMapping] {
        &self.ports
    }

    /// Environment, ordered by key.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Bind mounts.
    pub fn volumes(&self) -> &[VolumeMount] {
        &self.volumes
    }

    /// Device paths passed through to the workload.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// Whether the workload runs privileged.
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    /// Network attachment.
    pub fn network_mode(&self) -> &NetworkMode {
        &self.network_mode
    }

    /// Entrypoint override, empty for the image default.
    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    /// Whether the backend should restart the workload after a failed exit.
    pub fn restart_on_failure(&self) -> bool {
        self.restart_on_failure
    }

    /// Resource ceilings.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Trust anchor used to verify the image, if any.
    pub fn trust_anchor(&self) -> Option<&str> {
        self.trust_anchor.as_deref()
    }

    /// Whether verification should consult the transparency log.
    pub fn verify_transparency_log(&self) -> bool {
        self.verify_transparency_log
    }

    /// Registry credentials, if configured.
    pub fn credentials(&self) -> Option<&RegistryCredentials> {
        self.credentials.as_ref()
    }

    /// Start retry budget.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Copy of this descriptor with a different enablement flag.
    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }

    /// Names of the fields that differ between `self` and `other`.
    pub fn diff(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let mut check = |field: &'static str, differs: bool| {
            if differs {
                changed.push(field);
            }
        };
        check("name", self.name != other.name);
        check("enabled", self.enabled != other.enabled);
        check("image", self.image != other.image);
        check("tag", self.tag != other.tag);
        check("ports", self.ports != other.ports);
        check("environment", self.environment != other.environment);
        check("volumes", self.volumes != other.volumes);
        check("devices", self.devices != other.devices);
        check("privileged", self.privileged != other.privileged);
        check("network_mode", self.network_mode != other.network_mode);
        check("entrypoint", self.entrypoint != other.entrypoint);
        check(
            "restart_on_failure",
            self.restart_on_failure != other.restart_on_failure,
        );
        check("limits", self.limits != other.limits);
        check("trust_anchor", self.trust_anchor != other.trust_anchor);
        check(
            "verify_transparency_log",
            self.verify_transparency_log != other.verify_transparency_log,
        );
        check("credentials", self.credentials != other.credentials);
        check("retry", self.retry != other.retry);
        changed
    }
}

/// Builder for [`WorkloadDescriptor`]; every setter is optional.
#[derive(Debug, Clone)]
pub struct WorkloadDescriptorBuilder {
    inner: WorkloadDescriptor,
}

impl WorkloadDescriptorBuilder {
    /// Builder seeded with documented defaults.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            inner: WorkloadDescriptor {
                name: name.into(),
                enabled: false,
                image: image.into(),
                tag: DEFAULT_TAG.to_owned(),
                ports: Vec::new(),
                environment: BTreeMap::new(),
                volumes: Vec::new(),
                devices: Vec::new(),
                privileged: false,
                network_mode: NetworkMode::default(),
                entrypoint: Vec::new(),
                restart_on_failure: false,
                limits: ResourceLimits::default(),
                trust_anchor: None,
                verify_transparency_log: true,
                credentials: None,
                retry: RetryPolicy::default(),
            },
        }
    }

    /// Set the enablement flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.inner.enabled = enabled;
        self
    }

    /// Set the image tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.inner.tag = tag.into();
        self
    }

    /// Append a published port.
    pub fn port(mut self, internal: u16, external: u16, protocol: PortProtocol) -> Self {
        self.inner.ports.push(PortMapping {
            internal,
            external,
            protocol,
        });
        self
    }

    /// Set one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.environment.insert(key.into(), value.into());
        self
    }

    /// Append a bind mount.
    pub fn volume(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.inner.volumes.push(VolumeMount {
            host: host.into(),
            container: container.into(),
        });
        self
    }

    /// Append a device path.
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.inner.devices.push(device.into());
        self
    }

    /// Set the privileged flag.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.inner.privileged = privileged;
        self
    }

    /// Set the network mode.
    pub fn network_mode(mut self, mode: NetworkMode) -> Self {
        self.inner.network_mode = mode;
        self
    }

    /// Replace the entrypoint.
    pub fn entrypoint<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.entrypoint = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the restart-on-failure flag.
    pub fn restart_on_failure(mut self, restart: bool) -> Self {
        self.inner.restart_on_failure = restart;
        self
    }

    /// Replace the resource limits.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.inner.limits = limits;
        self
    }

    /// Set the trust anchor.
    pub fn trust_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.inner.trust_anchor = Some(anchor.into());
        self
    }

    /// Set the transparency log flag.
    pub fn verify_transparency_log(mut self, verify: bool) -> Self {
        self.inner.verify_transparency_log = verify;
        self
    }

    /// Set registry credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.inner.credentials = Some(RegistryCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the attempt budget, `0` for unlimited.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.inner.retry = RetryPolicy::new(max_retries, self.inner.retry.retry_interval());
        self
    }

    /// Set the delay between attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.inner.retry = RetryPolicy::new(self.inner.retry.max_retries(), interval);
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> WorkloadDescriptor {
        self.inner
    }
}
