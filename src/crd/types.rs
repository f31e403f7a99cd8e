//! Supporting types for the AtlasApp CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A tier of the promotion chain
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development
    Dev,
    /// Staging
    Stage,
    /// Production
    Prod,
}

/// The promotion chain: each tier and the tier it promotes into
///
/// Order is significant. Promotion only ever follows an edge of this table.
pub const PROMOTION_CHAIN: &[(Environment, Option<Environment>)] = &[
    (Environment::Dev, Some(Environment::Stage)),
    (Environment::Stage, Some(Environment::Prod)),
    (Environment::Prod, None),
];

impl Environment {
    /// Wire name of the environment (also the namespace name)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Stage => "stage",
            Self::Prod => "prod",
        }
    }

    /// Parse an environment name; unknown names yield `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dev" => Some(Self::Dev),
            "stage" => Some(Self::Stage),
            "prod" => Some(Self::Prod),
            _ => None,
        }
    }

    /// The tier this one promotes into
    pub fn next(&self) -> Option<Self> {
        PROMOTION_CHAIN
            .iter()
            .find(|(env, _)| env == self)
            .and_then(|(_, next)| *next)
    }

    /// True for the last tier before the terminal one
    pub fn is_penultimate(&self) -> bool {
        self.next().is_some_and(|next| next.next().is_none())
    }

    /// True for the production tier
    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look up the environment that follows `env` in the promotion chain
///
/// Returns `None` for the terminal tier and for unknown names.
pub fn next_environment(env: &str) -> Option<Environment> {
    Environment::parse(env).and_then(|e| e.next())
}

/// Application lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppPhase {
    /// Not yet reconciled
    #[default]
    Pending,
    /// Children exist but are not all ready
    Deploying,
    /// Blocked on manual approval for a prod rollout
    PendingApproval,
    /// All replicas ready and the health check (if any) passed
    Ready,
    /// Replicas ready but the health check failed
    Unhealthy,
    /// Child synchronization failed
    Failed,
}

impl AppPhase {
    /// True for phases that should be rechecked on the short interval
    pub fn is_converging(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Deploying | Self::Unhealthy | Self::Failed
        )
    }
}

impl std::fmt::Display for AppPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Deploying => write!(f, "Deploying"),
            Self::PendingApproval => write!(f, "PendingApproval"),
            Self::Ready => write!(f, "Ready"),
            Self::Unhealthy => write!(f, "Unhealthy"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition recording a phase transition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (the phase entered)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Condition recording entry into `phase` at `time`
    pub fn phase_entered(phase: AppPhase, message: impl Into<String>, time: DateTime<Utc>) -> Self {
        let status = match phase {
            AppPhase::Ready => ConditionStatus::True,
            AppPhase::Pending => ConditionStatus::Unknown,
            _ => ConditionStatus::False,
        };
        Self {
            type_: phase.to_string(),
            status,
            reason: phase.to_string(),
            message: message.into(),
            last_transition_time: time,
        }
    }
}
