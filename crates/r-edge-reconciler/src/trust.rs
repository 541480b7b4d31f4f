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

use r_edge_workload::{RegistryCredentials, WorkloadDescriptor};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Parameters handed to a [`TrustValidator`].
#[derive(Debug, Clone, Copy)]
pub struct TrustRequest<'a> {
    /// Image repository.
    pub image: &'a str,
    /// Image tag.
    pub tag: &'a str,
    /// Trust anchor the signature must chain to.
    pub trust_anchor: &'a str,
    /// Whether the transparency log should be consulted.
    pub verify_transparency_log: bool,
    /// Registry credentials, when the registry requires them.
    pub credentials: Option<&'a RegistryCredentials>,
}

impl<'a> TrustRequest<'a> {
    /// Build a request for a descriptor; `None` when it carries no trust anchor.
    pub fn for_descriptor(descriptor: &'a WorkloadDescriptor) -> Option<Self> {
        descriptor.trust_anchor().map(|anchor| Self {
            image: descriptor.image(),
            tag: descriptor.tag(),
            trust_anchor: anchor,
            verify_transparency_log: descriptor.verify_transparency_log(),
            credentials: descriptor.credentials(),
        })
    }

    /// `image:tag` reference being verified.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Answer returned by a validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustVerdict {
    /// Whether the image may be launched.
    pub valid: bool,
    /// Verified image digest, when known.
    pub digest: Option<String>,
}

/// Failures raised while trying to reach a verdict.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrustError {
    /// The requested trust anchor is not configured.
    #[error("unknown trust anchor `{0}`")]
    UnknownAnchor(String),
    /// The validator could not consult its sources.
    #[error("trust validator unavailable: {0}")]
    Unavailable(String),
    /// Verification aborted.
    #[error("verification failed: {0}")]
    Failed(String),
}

/// Vets an image against a trust anchor. Expected to be fast and local.
pub trait TrustValidator: Send + Sync + fmt::Debug {
    /// Verify the referenced image.
    fn verify(&self, request: &TrustRequest<'_>) -> Result<TrustVerdict, TrustError>;
}

/// What happened when a descriptor went through image trust validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Nothing to verify.
    Skipped,
    /// The image verified.
    Verified {
        /// Digest reported by the validator.
        digest: Option<String>,
    },
    /// The validator answered that the image must not run.
    Rejected,
    /// A trust anchor is configured but no validator is installed.
    Unavailable,
    /// A validator is installed and verification was requested, but no anchor is configured.
    AnchorMissing,
    /// The validator failed.
    Error(TrustError),
}

impl ValidationOutcome {
    /// Whether an enforcing policy would let the workload start.
    pub fn permits_launch(&self) -> bool {
        matches!(
            self,
            ValidationOutcome::Skipped
                | ValidationOutcome::Verified { .. }
                | ValidationOutcome::AnchorMissing
        )
    }
}

impl fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationOutcome::Skipped => f.write_str("skipped"),
            ValidationOutcome::Verified { .. } => f.write_str("verified"),
            ValidationOutcome::Rejected => f.write_str("rejected"),
            ValidationOutcome::Unavailable => f.write_str("validator-unavailable"),
            ValidationOutcome::AnchorMissing => f.write_str("anchor-missing"),
            ValidationOutcome::Error(err) => write!(f, "error: {err}"),
        }
    }
}

/// Run image trust validation for `descriptor` and log the outcome.
///
/// Never fails: every problem is folded into the returned [`ValidationOutcome`].
pub fn evaluate(
    descriptor: &WorkloadDescriptor,
    validator: Option<&dyn TrustValidator>,
) -> ValidationOutcome {
    let workload = descriptor.name();
    let reference = descriptor.image_reference();

    let outcome = match (TrustRequest::for_descriptor(descriptor), validator) {
        (None, Some(_)) if descriptor.verify_transparency_log() => ValidationOutcome::AnchorMissing,
        (None, _) => ValidationOutcome::Skipped,
        (Some(_), None) => ValidationOutcome::Unavailable,
        (Some(request), Some(validator)) => match validator.verify(&request) {
            Ok(TrustVerdict { valid: true, digest }) => ValidationOutcome::Verified { digest },
            Ok(TrustVerdict { valid: false, .. }) => ValidationOutcome::Rejected,
            Err(err) => ValidationOutcome::Error(err),
        },
    };

    match &outcome {
        ValidationOutcome::Skipped => {
            debug!(workload, image = %reference, "image trust validation not configured");
        }
        ValidationOutcome::Verified { digest } => {
            info!(
                workload,
                image = %reference,
                digest = digest.as_deref().unwrap_or("unknown"),
                "image signature verified",
            );
        }
        ValidationOutcome::Rejected => {
            warn!(workload, image = %reference, "image signature rejected by trust validator");
        }
        ValidationOutcome::Unavailable => {
            warn!(
                workload,
                image = %reference,
                anchor = descriptor.trust_anchor().unwrap_or_default(),
                "trust anchor configured but no trust validator is available",
            );
        }
        ValidationOutcome::AnchorMissing => {
            warn!(workload, image = %reference, "image verification expected but no trust anchor configured");
        }
        ValidationOutcome::Error(err) => {
            warn!(workload, image = %reference, error = %err, "image trust validation failed");
        }
    }
    outcome
}
