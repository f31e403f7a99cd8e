//! AtlasApp Custom Resource Definition
//!
//! An AtlasApp describes one deployable application in one environment. The
//! namespace doubles as the environment; the controller materializes a
//! Deployment and a Service for it and may replicate it into the next
//! environment of the promotion chain.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AppPhase, Condition, Environment};
use crate::{APPROVED_VERSION_ANNOTATION, PROMOTION_APPROVED_ANNOTATION};

/// Maximum number of phase-transition conditions kept in status
pub const MAX_CONDITIONS: usize = 10;

/// Specification for an AtlasApp
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "atlas.io",
    version = "v1",
    kind = "AtlasApp",
    plural = "atlasapps",
    shortname = "aa",
    status = "AtlasAppStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Environment","type":"string","jsonPath":".spec.environment"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Migration","type":"integer","jsonPath":".spec.migrationId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AtlasAppSpec {
    /// Environment this instance runs in (dev, stage, prod)
    pub environment: String,

    /// Application version; becomes the image tag
    pub version: String,

    /// Database migration identifier exported to the container
    #[serde(default)]
    pub migration_id: i64,

    /// Desired replica count
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Replicate into `next_environment` once Ready
    #[serde(default)]
    pub auto_promote: bool,

    /// Target of promotion; empty means none
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_environment: String,

    /// Hold prod rollouts until a human approves the version
    #[serde(default)]
    pub require_approval: bool,

    /// HTTP path probed on the Service once replicas are ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

impl AtlasAppSpec {
    /// The parsed environment, if it is a known tier
    pub fn tier(&self) -> Option<Environment> {
        Environment::parse(&self.environment)
    }

    /// True when this instance runs in prod
    pub fn is_prod(&self) -> bool {
        self.tier().is_some_and(|e| e.is_prod())
    }

    /// The configured health path, treating an empty string as unset
    pub fn health_path(&self) -> Option<&str> {
        self.health_check_path.as_deref().filter(|p| !p.is_empty())
    }

    /// True when promotion is requested for this instance
    pub fn wants_promotion(&self) -> bool {
        self.auto_promote && !self.next_environment.is_empty()
    }
}

/// Status for an AtlasApp
///
/// Every field is always serialized so a merge patch of a freshly projected
/// status replaces stale values instead of leaving them behind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AtlasAppStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: AppPhase,

    /// True iff the phase is Ready
    #[serde(default)]
    pub ready: bool,

    /// Ready replicas observed on the Deployment
    #[serde(default)]
    pub ready_replicas: i32,

    /// Total replicas observed on the Deployment
    #[serde(default)]
    pub total_replicas: i32,

    /// When the status last changed
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,

    /// Waiting on a human to approve the prod rollout
    #[serde(default)]
    pub approval_required: bool,

    /// Waiting on a human to authorize promotion into prod
    #[serde(default)]
    pub promotion_pending: bool,

    /// Human-readable message about current state
    #[serde(default)]
    pub message: String,

    /// Recent phase transitions, newest last
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl AtlasAppStatus {
    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: AppPhase) -> Self {
        self.phase = phase;
        self.ready = phase == AppPhase::Ready;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = msg.into();
        self
    }

    /// Set observed replica counts and return self for chaining
    pub fn replicas(mut self, ready: i32, total: i32) -> Self {
        self.ready_replicas = ready;
        self.total_replicas = total;
        self
    }

    /// Append a condition, dropping the oldest beyond [`MAX_CONDITIONS`]
    pub fn push_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
        if self.conditions.len() > MAX_CONDITIONS {
            let excess = self.conditions.len() - MAX_CONDITIONS;
            self.conditions.drain(..excess);
        }
    }

    /// Equality ignoring `last_update`
    pub fn same_state(&self, other: &Self) -> bool {
        self.phase == other.phase
            && self.ready == other.ready
            && self.ready_replicas == other.ready_replicas
            && self.total_replicas == other.total_replicas
            && self.approval_required == other.approval_required
            && self.promotion_pending == other.promotion_pending
            && self.message == other.message
            && self.conditions == other.conditions
            && self.observed_generation == other.observed_generation
    }
}

impl AtlasApp {
    /// Version a human approved for prod rollout, if any
    pub fn approved_version(&self) -> Option<&str> {
        self.annotations()
            .get(APPROVED_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    /// Version a human authorized for promotion into prod, if any
    pub fn promotion_approved_version(&self) -> Option<&str> {
        self.annotations()
            .get(PROMOTION_APPROVED_ANNOTATION)
            .map(String::as_str)
    }

    /// `namespace/name` key used in logs and errors
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
