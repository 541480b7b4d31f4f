//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "03-trust"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Static allowlist standing in for image signature verification."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use indexmap::IndexMap;
use r_edge_common::TrustAnchorConfig;
use r_edge_reconciler::{TrustError, TrustRequest, TrustValidator, TrustVerdict};

/// Trust validator backed by per-anchor allowlists of `image:tag` references.
#[derive(Debug, Clone, Default)]
pub struct AllowlistValidator {
    anchors: IndexMap<String, IndexMap<String, String>>,
}

impl AllowlistValidator {
    /// Empty validator; every anchor is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator built from the simulation trust anchor table.
    pub fn from_config(anchors: &IndexMap<String, TrustAnchorConfig>) -> Self {
        let anchors = anchors
            .iter()
            .map(|(anchor, config)| (anchor.clone(), config.allowed.clone()))
            .collect();
        Self { anchors }
    }

    /// Allow `reference` under `anchor` with a pinned `digest`.
    pub fn allow(
        mut self,
        anchor: impl Into<String>,
        reference: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        self.anchors
            .entry(anchor.into())
            .or_default()
            .insert(reference.into(), digest.into());
        self
    }
}

impl TrustValidator for AllowlistValidator {
    fn verify(&self, request: &TrustRequest<'_>) -> Result<TrustVerdict, TrustError> {
        let allowed = self
            .anchors
            .get(request.trust_anchor)
            .ok_or_else(|| TrustError::UnknownAnchor(request.trust_anchor.to_owned()))?;
        Ok(match allowed.get(&request.reference()) {
            Some(digest) => TrustVerdict {
                valid: true,
                digest: Some(digest.clone()),
            },
            None => TrustVerdict {
                valid: false,
                digest: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(anchor: &'a str, tag: &'a str) -> TrustRequest<'a> {
        TrustRequest {
            image: "registry.local/historian",
            tag,
            trust_anchor: anchor,
            verify_transparency_log: true,
            credentials: None,
        }
    }

    #[test]
    fn pinned_reference_verifies() {
        let validator = AllowlistValidator::new().allow(
            "fleet-root",
            "registry.local/historian:2.1",
            "sha256:9f2c",
        );
        assert_eq!(
            validator.verify(&request("fleet-root", "2.1")).unwrap(),
            TrustVerdict {
                valid: true,
                digest: Some("sha256:9f2c".into())
            }
        );
        assert!(!validator.verify(&request("fleet-root", "2.2")).unwrap().valid);
        assert_eq!(
            validator.verify(&request("other", "2.1")),
            Err(TrustError::UnknownAnchor("other".into()))
        );
    }
}
