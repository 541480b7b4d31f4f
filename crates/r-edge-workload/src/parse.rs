//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Workload descriptors describing the desired state of a container."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Raw key-value configuration to [`WorkloadDescriptor`] conversion.
//!
//! Lists are comma separated; surrounding whitespace and empty entries are
//! ignored so that `"80, 443"` and `"80,443,"` describe the same workload.

use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use crate::descriptor::{
    GpuRequest, NetworkMode, PortProtocol, ResourceLimits, WorkloadDescriptor,
};
use crate::error::{DescriptorError, WorkloadConfigError};
use crate::keys;

/// Parse every workload in a name → properties map, failing on the first invalid entry.
pub fn parse_workloads(
    workloads: &IndexMap<String, IndexMap<String, String>>,
) -> Result<Vec<WorkloadDescriptor>, WorkloadConfigError> {
    workloads
        .iter()
        .map(|(name, properties)| {
            parse_descriptor(name, properties).map_err(|source| WorkloadConfigError {
                workload: name.clone(),
                source,
            })
        })
        .collect()
}

/// Build a descriptor from raw properties, applying defaults for every optional key.
pub fn parse_descriptor(
    name: &str,
    properties: &IndexMap<String, String>,
) -> Result<WorkloadDescriptor, DescriptorError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DescriptorError::EmptyName);
    }
    for key in properties.keys() {
        if !keys::ALL.contains(&key.as_str()) {
            debug!(workload = name, key = %key, "ignoring unrecognised workload property");
        }
    }
    let raw = Properties(properties);

    let image = raw
        .get(keys::IMAGE)
        .ok_or(DescriptorError::MissingKey(keys::IMAGE))?;
    let mut builder = WorkloadDescriptor::builder(name, image)
        .enabled(raw.bool_or(keys::ENABLED, false)?)
        .privileged(raw.bool_or(keys::PRIVILEGED, false)?)
        .restart_on_failure(raw.bool_or(keys::RESTART_ON_FAILURE, false)?)
        .verify_transparency_log(raw.bool_or(keys::VERIFY_TRANSPARENCY_LOG, true)?)
        .network_mode(raw.get(keys::NETWORK_MODE).map(NetworkMode::parse).unwrap_or_default())
        .entrypoint(raw.list(keys::ENTRYPOINT))
        .limits(parse_limits(&raw)?);

    if let Some(tag) = raw.get(keys::TAG) {
        builder = builder.tag(tag);
    }
    for (internal, external, protocol) in parse_ports(&raw)? {
        builder = builder.port(internal, external, protocol);
    }
    for entry in raw.list(keys::ENV) {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| DescriptorError::invalid(keys::ENV, entry, "expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(DescriptorError::invalid(keys::ENV, entry, "empty variable name"));
        }
        builder = builder.env(key, value.trim());
    }
    for entry in raw.list(keys::VOLUME) {
        let (host, container) = entry
            .split_once(':')
            .map(|(host, container)| (host.trim(), container.trim()))
            .filter(|(host, container)| !host.is_empty() && !container.is_empty())
            .ok_or_else(|| {
                DescriptorError::invalid(keys::VOLUME, entry, "expected host:container")
            })?;
        builder = builder.volume(host, container);
    }
    for device in raw.list(keys::DEVICE) {
        builder = builder.device(device);
    }
    if let Some(anchor) = raw.get(keys::TRUST_ANCHOR) {
        builder = builder.trust_anchor(anchor);
    }
    match (raw.get(keys::REGISTRY_USERNAME), raw.get(keys::REGISTRY_PASSWORD)) {
        (Some(username), Some(password)) => builder = builder.credentials(username, password),
        (None, None) => {}
        _ => return Err(DescriptorError::IncompleteCredentials),
    }
    if let Some(value) = raw.get(keys::MAX_RETRIES) {
        let max_retries = value.parse::<u32>().map_err(|err| {
            DescriptorError::invalid(keys::MAX_RETRIES, value, err.to_string())
        })?;
        builder = builder.max_retries(max_retries);
    }
    if let Some(value) = raw.get(keys::RETRY_INTERVAL_MS) {
        let millis = value.parse::<u64>().map_err(|err| {
            DescriptorError::invalid(keys::RETRY_INTERVAL_MS, value, err.to_string())
        })?;
        builder = builder.retry_interval(Duration::from_millis(millis));
    }

    Ok(builder.build())
}

struct Properties<'a>(&'a IndexMap<String, String>);

impl<'a> Properties<'a> {
    /// Trimmed value, treating blank strings as absent.
    fn get(&self, key: &'static str) -> Option<&'a str> {
        self.0
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    fn list(&self, key: &'static str) -> Vec<&'a str> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn bool_or(&self, key: &'static str, default: bool) -> Result<bool, DescriptorError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(DescriptorError::invalid(key, value, "expected a boolean")),
            },
        }
    }
}

fn parse_ports(raw: &Properties<'_>) -> Result<Vec<(u16, u16, PortProtocol)>, DescriptorError> {
    let internal = parse_port_list(raw, keys::PORTS_INTERNAL)?;
    let external = parse_port_list(raw, keys::PORTS_EXTERNAL)?;
    if internal.len() != external.len() {
        return Err(DescriptorError::PortCountMismatch {
            internal: internal.len(),
            external: external.len(),
        });
    }
    let protocols = raw
        .list(keys::PORTS_PROTOCOL)
        .into_iter()
        .map(|entry| match entry.to_ascii_lowercase().as_str() {
            "tcp" => Ok(PortProtocol::Tcp),
            "udp" => Ok(PortProtocol::Udp),
            _ => Err(DescriptorError::invalid(
                keys::PORTS_PROTOCOL,
                entry,
                "expected tcp or udp",
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if protocols.len() > internal.len() {
        return Err(DescriptorError::ProtocolCountMismatch {
            protocols: protocols.len(),
            ports: internal.len(),
        });
    }
    Ok(internal
        .into_iter()
        .zip(external)
        .enumerate()
        .map(|(index, (internal, external))| {
            let protocol = protocols.get(index).copied().unwrap_or_default();
            (internal, external, protocol)
        })
        .collect())
}

fn parse_port_list(raw: &Properties<'_>, key: &'static str) -> Result<Vec<u16>, DescriptorError> {
    raw.list(key)
        .into_iter()
        .map(|entry| match entry.parse::<u16>() {
            Ok(0) => Err(DescriptorError::invalid(key, entry, "port must be non-zero")),
            Ok(port) => Ok(port),
            Err(err) => Err(DescriptorError::invalid(key, entry, err.to_string())),
        })
        .collect()
}

fn parse_limits(raw: &Properties<'_>) -> Result<ResourceLimits, DescriptorError> {
    let memory_bytes = raw.get(keys::MEMORY).map(parse_memory).transpose()?;
    let millicpus = raw.get(keys::CPUS).map(parse_cpus).transpose()?;
    let gpus = match raw.get(keys::GPUS) {
        None => GpuRequest::None,
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "none" | "0" => GpuRequest::None,
            "all" => GpuRequest::All,
            _ => value
                .parse::<u32>()
                .map(GpuRequest::Count)
                .map_err(|_| DescriptorError::invalid(keys::GPUS, value, "expected all, none or a count"))?,
        },
    };
    Ok(ResourceLimits {
        memory_bytes,
        millicpus,
        gpus,
        runtime: raw.get(keys::RUNTIME).map(str::to_owned),
    })
}

fn parse_memory(value: &str) -> Result<u64, DescriptorError> {
    let lower = value.to_ascii_lowercase();
    let digits_end = lower
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(lower.len());
    let (number, suffix) = lower.split_at(digits_end);
    let multiplier: u64 = match suffix.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => {
            return Err(DescriptorError::invalid(
                keys::MEMORY,
                value,
                "unknown size suffix",
            ))
        }
    };
    let amount = number
        .parse::<u64>()
        .map_err(|err| DescriptorError::invalid(keys::MEMORY, value, err.to_string()))?;
    amount
        .checked_mul(multiplier)
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| DescriptorError::invalid(keys::MEMORY, value, "out of range"))
}

fn parse_cpus(value: &str) -> Result<u32, DescriptorError> {
    let cpus = value
        .parse::<f64>()
        .map_err(|err| DescriptorError::invalid(keys::CPUS, value, err.to_string()))?;
    if !cpus.is_finite() || cpus <= 0.0 || cpus > f64::from(u32::MAX) / 1000.0 {
        return Err(DescriptorError::invalid(keys::CPUS, value, "out of range"));
    }
    Ok((cpus * 1000.0).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, &str)]) -> IndexMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn minimal_configuration_uses_defaults() {
        let descriptor = parse_descriptor("web", &props(&[(keys::IMAGE, "nginx")])).unwrap();
        assert_eq!(
            descriptor,
            WorkloadDescriptor::builder("web", "nginx").build()
        );
    }

    #[test]
    fn whitespace_in_lists_is_insignificant() {
        let tidy = parse_descriptor(
            "web",
            &props(&[
                (keys::IMAGE, "nginx"),
                (keys::PORTS_INTERNAL, "80,443"),
                (keys::PORTS_EXTERNAL, "8080,8443"),
                (keys::ENV, "A=1,B=2"),
            ]),
        )
        .unwrap();
        let messy = parse_descriptor(
            "web",
            &props(&[
                (keys::IMAGE, " nginx "),
                (keys::PORTS_INTERNAL, " 80 , 443 ,"),
                (keys::PORTS_EXTERNAL, "8080,  8443"),
                (keys::ENV, "B = 2, A=1"),
            ]),
        )
        .unwrap();
        assert_eq!(tidy, messy);
    }

    #[test]
    fn parses_full_property_set() {
        let descriptor = parse_descriptor(
            "modbus-bridge",
            &props(&[
                (keys::ENABLED, "true"),
                (keys::IMAGE, "registry.local/modbus"),
                (keys::TAG, "2.1"),
                (keys::PORTS_INTERNAL, "502,1502"),
                (keys::PORTS_EXTERNAL, "502,1502"),
                (keys::PORTS_PROTOCOL, "tcp,udp"),
                (keys::VOLUME, "/var/lib/modbus:/data"),
                (keys::DEVICE, "/dev/ttyUSB0"),
                (keys::PRIVILEGED, "yes"),
                (keys::NETWORK_MODE, "host"),
                (keys::ENTRYPOINT, "/bin/bridge,--verbose"),
                (keys::MEMORY, "256m"),
                (keys::CPUS, "0.5"),
                (keys::GPUS, "all"),
                (keys::RUNTIME, "runc"),
                (keys::TRUST_ANCHOR, "edge-root"),
                (keys::VERIFY_TRANSPARENCY_LOG, "false"),
                (keys::REGISTRY_USERNAME, "edge"),
                (keys::REGISTRY_PASSWORD, "token"),
                (keys::MAX_RETRIES, "5"),
                (keys::RETRY_INTERVAL_MS, "250"),
            ]),
        )
        .unwrap();

        assert!(descriptor.enabled());
        assert_eq!(descriptor.image_reference(), "registry.local/modbus:2.1");
        assert_eq!(descriptor.ports().len(), 2);
        assert_eq!(descriptor.ports()[1].protocol, PortProtocol::Udp);
        assert_eq!(descriptor.volumes()[0].container, "/data");
        assert_eq!(descriptor.devices(), ["/dev/ttyUSB0"]);
        assert!(descriptor.privileged());
        assert_eq!(descriptor.network_mode(), &NetworkMode::Host);
        assert_eq!(descriptor.entrypoint(), ["/bin/bridge", "--verbose"]);
        assert_eq!(descriptor.limits().memory_bytes, Some(256 * 1024 * 1024));
        assert_eq!(descriptor.limits().millicpus, Some(500));
        assert_eq!(descriptor.limits().gpus, GpuRequest::All);
        assert_eq!(descriptor.trust_anchor(), Some("edge-root"));
        assert!(!descriptor.verify_transparency_log());
        assert_eq!(descriptor.credentials().unwrap().username, "edge");
        assert_eq!(descriptor.retry_policy().max_retries(), 5);
        assert_eq!(
            descriptor.retry_policy().retry_interval(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn missing_image_is_rejected() {
        let err = parse_descriptor("web", &props(&[(keys::ENABLED, "true")])).unwrap_err();
        assert_eq!(err, DescriptorError::MissingKey(keys::IMAGE));
    }

    #[test]
    fn mismatched_ports_are_rejected() {
        let err = parse_descriptor(
            "web",
            &props(&[
                (keys::IMAGE, "nginx"),
                (keys::PORTS_INTERNAL, "80,443"),
                (keys::PORTS_EXTERNAL, "8080"),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            DescriptorError::PortCountMismatch {
                internal: 2,
                external: 1
            }
        );
    }

    #[test]
    fn half_credentials_are_rejected() {
        let err = parse_descriptor(
            "web",
            &props(&[(keys::IMAGE, "nginx"), (keys::REGISTRY_USERNAME, "edge")]),
        )
        .unwrap_err();
        assert_eq!(err, DescriptorError::IncompleteCredentials);
    }

    #[test]
    fn invalid_values_name_the_key() {
        for (key, value) in [
            (keys::ENABLED, "maybe"),
            (keys::MEMORY, "12q"),
            (keys::CPUS, "-1"),
            (keys::GPUS, "many"),
            (keys::MAX_RETRIES, "-3"),
            (keys::ENV, "NOVALUE"),
            (keys::VOLUME, "/only-host"),
        ] {
            let err = parse_descriptor("web", &props(&[(keys::IMAGE, "nginx"), (key, value)]))
                .unwrap_err();
            match err {
                DescriptorError::InvalidValue { key: reported, .. } => assert_eq!(reported, key),
                other => panic!("unexpected error for {key}: {other:?}"),
            }
        }
    }

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("512").unwrap(), 512);
        assert_eq!(parse_memory("2k").unwrap(), 2048);
        assert_eq!(parse_memory("1GB").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_memory("0").is_err());
    }

    #[test]
    fn parse_workloads_attributes_errors() {
        let mut workloads = IndexMap::new();
        workloads.insert("ok".to_string(), props(&[(keys::IMAGE, "nginx")]));
        workloads.insert("broken".to_string(), props(&[(keys::TAG, "1.0")]));
        let err = parse_workloads(&workloads).unwrap_err();
        assert_eq!(err.workload, "broken");
        assert_eq!(err.source, DescriptorError::MissingKey(keys::IMAGE));
    }
}
