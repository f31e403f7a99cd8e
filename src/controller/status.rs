//! Status projection
//!
//! Phase and readiness are derived only from what was observed this
//! reconcile: the Deployment's replica counts, whether synchronizing the
//! children failed, and the health probe result. Nothing is carried forward
//! from the previous status except the condition log and the timestamp,
//! which [`finalize`] preserves when nothing else changed.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;

use crate::crd::{AppPhase, AtlasAppStatus, Condition};

/// Message for a fully ready application
pub const READY_MESSAGE: &str = "Application is healthy and ready";

/// Message when replicas are ready but the probe failed
pub const UNHEALTHY_MESSAGE: &str = "Health check failed";

/// Result of probing the application's endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthResult {
    /// No health path configured, or replicas had not converged
    NotConfigured,
    /// Probe returned a success status
    Passed,
    /// Probe failed, errored or timed out
    Failed,
}

/// Replica counts observed on the workload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadObservation {
    /// Ready replicas
    pub ready: i32,
    /// Total replicas
    pub total: i32,
    /// The counts describe an older pod template than the one now applied
    pub rolling_out: bool,
}

impl WorkloadObservation {
    /// Read counts from a Deployment's status
    ///
    /// `written` is true when this reconcile created or replaced the
    /// Deployment. Its status then still describes the previous template, so
    /// the observation is rolling out whatever the counts say. The same holds
    /// while the deployment controller has not observed the latest generation
    /// or has not yet moved every replica to the new template.
    pub fn from_deployment(deployment: &Deployment, written: bool) -> Self {
        let status = deployment.status.as_ref();
        let total = status.and_then(|s| s.replicas).unwrap_or(0);

        let generation_pending = match (
            deployment.metadata.generation,
            status.and_then(|s| s.observed_generation),
        ) {
            (Some(generation), Some(observed)) => observed < generation,
            (Some(_), None) => status.is_some(),
            _ => false,
        };
        let replicas_pending = status
            .and_then(|s| s.updated_replicas)
            .is_some_and(|updated| updated < total);

        Self {
            ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            total,
            rolling_out: written || generation_pending || replicas_pending,
        }
    }

    /// All replicas ready on the current template, and at least one exists
    pub fn converged(&self) -> bool {
        !self.rolling_out && self.total > 0 && self.ready == self.total
    }
}

/// Everything the projector looks at
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// Workload replica counts
    pub workload: WorkloadObservation,
    /// Error text if synchronizing a child failed
    pub sync_error: Option<String>,
    /// Health probe result
    pub health: HealthResult,
}

/// Projected phase and the fields that go with it
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    /// Derived phase
    pub phase: AppPhase,
    /// Human-readable message
    pub message: String,
    /// Ready replicas
    pub ready_replicas: i32,
    /// Total replicas
    pub total_replicas: i32,
}

impl Projection {
    /// Status carrying this projection; latches and metadata start cleared
    pub fn into_status(self) -> AtlasAppStatus {
        AtlasAppStatus::default()
            .phase(self.phase)
            .message(self.message)
            .replicas(self.ready_replicas, self.total_replicas)
    }
}

/// Derive the phase from an observation
pub fn project(observation: &Observation) -> Projection {
    let WorkloadObservation { ready, total, .. } = observation.workload;

    let (phase, message) = if let Some(err) = &observation.sync_error {
        (AppPhase::Failed, err.clone())
    } else if !observation.workload.converged() {
        (
            AppPhase::Deploying,
            format!("Waiting for deployment to be ready ({ready}/{total} replicas ready)"),
        )
    } else {
        match observation.health {
            HealthResult::Failed => (AppPhase::Unhealthy, UNHEALTHY_MESSAGE.to_string()),
            HealthResult::Passed | HealthResult::NotConfigured => {
                (AppPhase::Ready, READY_MESSAGE.to_string())
            }
        }
    };

    Projection {
        phase,
        message,
        ready_replicas: ready,
        total_replicas: total,
    }
}

/// Merge a freshly computed status with the previous one
///
/// Returns `prior` untouched when every field other than `lastUpdate`
/// matches, so an unchanged world produces no write. Otherwise stamps
/// `lastUpdate` and logs a condition if the phase changed.
pub fn finalize(
    prior: Option<&AtlasAppStatus>,
    mut next: AtlasAppStatus,
    now: DateTime<Utc>,
) -> AtlasAppStatus {
    next.conditions = prior.map(|p| p.conditions.clone()).unwrap_or_default();
    next.last_update = prior.and_then(|p| p.last_update);

    if let Some(prior) = prior {
        if prior.same_state(&next) {
            return prior.clone();
        }
    }

    if prior.map(|p| p.phase) != Some(next.phase) {
        let condition = Condition::phase_entered(next.phase, next.message.clone(), now);
        next.push_condition(condition);
    }
    next.last_update = Some(now);
    next
}
