//! Manual approval gate for production rollouts
//!
//! A prod AtlasApp with `requireApproval` is held in `PendingApproval` until a
//! human records the approved version in the `atlas.io/approved-version`
//! annotation. Approval is per version: bumping the version re-arms the gate.

use crate::crd::{AtlasAppSpec, AtlasAppStatus};

/// Outcome of evaluating the gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// No approval needed
    Proceed,
    /// Approval needed and granted for this version
    Approved {
        /// The previous status was holding the app at the gate
        was_blocked: bool,
    },
    /// Approval needed and not granted; children must not be touched
    Blocked {
        /// The gate was not already holding the app
        first_trip: bool,
    },
}

/// Evaluate the gate for a spec, its previous status and the approval annotation
pub fn evaluate(
    spec: &AtlasAppSpec,
    prior: Option<&AtlasAppStatus>,
    approved_version: Option<&str>,
) -> GateDecision {
    if !spec.is_prod() || !spec.require_approval {
        return GateDecision::Proceed;
    }

    let was_blocked = prior.is_some_and(|s| s.approval_required);
    if approved_version == Some(spec.version.as_str()) {
        GateDecision::Approved { was_blocked }
    } else {
        GateDecision::Blocked {
            first_trip: !was_blocked,
        }
    }
}

/// Message recorded while the gate holds
pub const APPROVAL_MESSAGE: &str = "Production deployment requires manual approval";
