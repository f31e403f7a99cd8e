//! Kubernetes Event recording for the AtlasApp controller.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconciles can
//! emit Events visible via `kubectl describe atlasapp` while tests swap in a
//! recorder of their own.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason, one of [`reasons`]
    /// * `action` - What was done, one of [`actions`]
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reason strings, shown under REASON in `kubectl get events`.
pub mod reasons {
    /// A prod rollout is waiting for manual approval
    pub const APPROVAL_REQUIRED: &str = "ApprovalRequired";
    /// Manual approval was granted and the rollout continues
    pub const APPROVAL_GRANTED: &str = "ApprovalGranted";
    /// All replicas ready and healthy
    pub const DEPLOYED: &str = "Deployed";
    /// Replicas ready but the health probe failed
    pub const UNHEALTHY: &str = "Unhealthy";
    /// Creating or updating a child failed
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// Sibling created or updated in the next environment
    pub const PROMOTED: &str = "Promoted";
    /// Promotion into prod waits for manual approval
    pub const PROMOTION_PENDING: &str = "PromotionPending";
    /// Promotion target is not the next tier of the chain
    pub const PROMOTION_HALTED: &str = "PromotionHalted";
    /// Writing the sibling failed
    pub const PROMOTION_FAILED: &str = "PromotionFailed";
}

/// Event action strings, shown under ACTION in `kubectl get events`.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Synchronizing child resources
    pub const SYNC: &str = "Sync";
    /// Promoting into the next environment
    pub const PROMOTE: &str = "Promote";
}
