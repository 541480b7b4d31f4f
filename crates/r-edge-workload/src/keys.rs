//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload descriptors describing the desired state of a container."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Raw configuration keys recognised by [`crate::parse_descriptor`].

/// Whether the workload should be running.
pub const ENABLED: &str = "container.enabled";
/// Image repository reference (required).
pub const IMAGE: &str = "container.image";
/// Image tag.
pub const TAG: &str = "container.image.tag";
/// Comma-separated container-side ports.
pub const PORTS_INTERNAL: &str = "container.ports.internal";
/// Comma-separated host-side ports, positionally paired with the internal ports.
pub const PORTS_EXTERNAL: &str = "container.ports.external";
/// Comma-separated `tcp`/`udp` protocols, positionally paired with the ports.
pub const PORTS_PROTOCOL: &str = "container.ports.protocol";
/// Comma-separated `KEY=VALUE` environment entries.
pub const ENV: &str = "container.env";
/// Comma-separated `host:container` volume mounts.
pub const VOLUME: &str = "container.volume";
/// Comma-separated device paths.
pub const DEVICE: &str = "container.device";
/// Run the workload privileged.
pub const PRIVILEGED: &str = "container.privileged";
/// Network mode (`bridge`, `host`, `none` or a named network).
pub const NETWORK_MODE: &str = "container.network.mode";
/// Comma-separated entrypoint override.
pub const ENTRYPOINT: &str = "container.entrypoint";
/// Ask the backend to restart the workload when it exits with a failure.
pub const RESTART_ON_FAILURE: &str = "container.restart.on.failure";
/// Memory limit with optional `b`/`k`/`m`/`g` suffix.
pub const MEMORY: &str = "container.memory";
/// Decimal CPU limit.
pub const CPUS: &str = "container.cpus";
/// GPU request: `all`, `none` or a count.
pub const GPUS: &str = "container.gpus";
/// Alternative container runtime.
pub const RUNTIME: &str = "container.runtime";
/// Trust anchor used to verify the image before launch.
pub const TRUST_ANCHOR: &str = "container.signature.trust.anchor";
/// Whether verification should consult the transparency log.
pub const VERIFY_TRANSPARENCY_LOG: &str = "container.signature.verify.transparency.log";
/// Registry username passed to the trust validator.
pub const REGISTRY_USERNAME: &str = "registry.username";
/// Registry password passed to the trust validator.
pub const REGISTRY_PASSWORD: &str = "registry.password";
/// Maximum start attempts, `0` for unlimited.
pub const MAX_RETRIES: &str = "container.retries.max";
/// Delay between start attempts in milliseconds.
pub const RETRY_INTERVAL_MS: &str = "container.retries.interval.ms";

/// Every key the parser understands.
pub const ALL: &[&str] = &[
    ENABLED,
    IMAGE,
    TAG,
    PORTS_INTERNAL,
    PORTS_EXTERNAL,
    PORTS_PROTOCOL,
    ENV,
    VOLUME,
    DEVICE,
    PRIVILEGED,
    NETWORK_MODE,
    ENTRYPOINT,
    RESTART_ON_FAILURE,
    MEMORY,
    CPUS,
    GPUS,
    RUNTIME,
    TRUST_ANCHOR,
    VERIFY_TRANSPARENCY_LOG,
    REGISTRY_USERNAME,
    REGISTRY_PASSWORD,
    MAX_RETRIES,
    RETRY_INTERVAL_MS,
];
