//! Environment promotion
//!
//! A Ready AtlasApp with `autoPromote` replicates itself into the next tier of
//! the promotion chain as a sibling AtlasApp of the same name, in the
//! namespace named after the target environment. [`plan`] decides what should
//! happen without touching the API server; [`execute`] applies a sibling.
//!
//! Promotion never skips a tier. Promotion into prod additionally waits for a
//! human to record the version in `atlas.io/promotion-approved-version`.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use super::client::AppKubeClient;
use crate::crd::{next_environment, AppPhase, AtlasApp, AtlasAppSpec, Environment};
use crate::workload::MANAGED_BY_LABEL;
use crate::{Error, CONTROLLER_NAME};

/// Label on a sibling recording the environment it was promoted from
pub const PROMOTED_FROM_LABEL: &str = "atlas.io/promoted-from";

/// Message recorded while promotion into prod waits for a human
pub const PROMOTION_PENDING_MESSAGE: &str = "Promotion to production requires manual approval";

/// What promotion should do this reconcile
#[derive(Clone, Debug, PartialEq)]
pub enum PromotionPlan {
    /// Not Ready, or promotion not requested
    None,
    /// Next hop is prod and no human has authorized this version
    AwaitManual {
        /// The environment promotion would go to
        target: Environment,
    },
    /// The requested hop is not an edge of the chain; nothing will be retried
    Halted {
        /// Why promotion cannot proceed
        reason: String,
    },
    /// Create or update this sibling
    Sibling(Box<AtlasApp>),
}

impl PromotionPlan {
    /// True when the promotion-pending latch should be set
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::AwaitManual { .. })
    }
}

/// What executing a sibling did
#[derive(Clone, Debug, PartialEq)]
pub enum PromotionOutcome {
    /// Sibling created in the target environment
    Created(AtlasApp),
    /// Existing sibling moved to the new version/migration
    Updated(AtlasApp),
    /// Sibling already carries this version and migration
    UpToDate,
}

/// Decide what promotion should do for an app whose phase this reconcile is `phase`
pub fn plan(app: &AtlasApp, phase: AppPhase) -> PromotionPlan {
    let spec = &app.spec;
    if phase != AppPhase::Ready || !spec.wants_promotion() {
        return PromotionPlan::None;
    }

    let Some(expected) = next_environment(&spec.environment) else {
        return PromotionPlan::Halted {
            reason: format!(
                "environment {:?} has no successor in the promotion chain",
                spec.environment
            ),
        };
    };

    if spec.next_environment != expected.as_str() {
        return PromotionPlan::Halted {
            reason: format!(
                "nextEnvironment {:?} does not follow {:?} (expected {:?})",
                spec.next_environment,
                spec.environment,
                expected.as_str()
            ),
        };
    }

    if expected.is_prod() && app.promotion_approved_version() != Some(spec.version.as_str()) {
        return PromotionPlan::AwaitManual { target: expected };
    }

    PromotionPlan::Sibling(Box::new(sibling_for(app, expected)))
}

/// The AtlasApp that represents `app` in `target`
fn sibling_for(app: &AtlasApp, target: Environment) -> AtlasApp {
    let spec = &app.spec;
    let source_is_penultimate = spec.tier().is_some_and(|t| t.is_penultimate());

    AtlasApp {
        metadata: ObjectMeta {
            name: Some(app.name_any()),
            namespace: Some(target.as_str().to_string()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), CONTROLLER_NAME.to_string()),
                (PROMOTED_FROM_LABEL.to_string(), spec.environment.clone()),
            ])),
            ..Default::default()
        },
        spec: AtlasAppSpec {
            environment: target.as_str().to_string(),
            version: spec.version.clone(),
            migration_id: spec.migration_id,
            replicas: spec.replicas,
            auto_promote: !source_is_penultimate,
            next_environment: target
                .next()
                .map(|e| e.as_str().to_string())
                .unwrap_or_default(),
            require_approval: target.is_prod(),
            health_check_path: spec.health_check_path.clone(),
        },
        status: None,
    }
}

/// Create the sibling, or move an existing one to the sibling's version
///
/// Only `version` and `migrationId` are ever changed on an existing sibling.
pub async fn execute(kube: &dyn AppKubeClient, sibling: &AtlasApp) -> Result<PromotionOutcome, Error> {
    let name = sibling.name_any();
    let namespace = sibling.namespace().unwrap_or_default();

    let existing = match kube.get_app(&name, &namespace).await? {
        Some(existing) => existing,
        None => match kube.create_app(sibling).await {
            Ok(created) => {
                info!(
                    app = %name,
                    environment = %namespace,
                    version = %sibling.spec.version,
                    "Created AtlasApp in next environment"
                );
                return Ok(PromotionOutcome::Created(created));
            }
            Err(Error::AlreadyExists { .. }) => kube
                .get_app(&name, &namespace)
                .await?
                .ok_or_else(|| Error::not_found("AtlasApp", format!("{namespace}/{name}")))?,
            Err(e) => return Err(e),
        },
    };

    if existing.spec.version == sibling.spec.version
        && existing.spec.migration_id == sibling.spec.migration_id
    {
        return Ok(PromotionOutcome::UpToDate);
    }

    let mut updated = existing;
    updated.spec.version = sibling.spec.version.clone();
    updated.spec.migration_id = sibling.spec.migration_id;
    let updated = kube.replace_app(&updated).await?;
    info!(
        app = %name,
        environment = %namespace,
        version = %sibling.spec.version,
        "Updated AtlasApp in next environment"
    );
    Ok(PromotionOutcome::Updated(updated))
}
