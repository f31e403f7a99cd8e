//! AtlasApp reconciliation
//!
//! One reconcile re-reads the AtlasApp and walks it through the approval gate,
//! child synchronization, health probing, status projection and promotion.
//! Every pass is level-triggered: nothing but the watch cache survives
//! between invocations, and the status written is fully derived from what
//! this pass observed.
//!
//! Shutdown is observed between steps. Once the token is cancelled a
//! reconcile stops before its next write and reports no error.
//!
//! Every live AtlasApp carries the [`CATALOG_FINALIZER`]. Deleting an app
//! therefore arrives here as an update with a deletion timestamp; the
//! catalog entity is removed before the finalizer is released.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::approval::{self, GateDecision, APPROVAL_MESSAGE};
use super::client::{AppKubeClient, AppKubeClientImpl};
use super::promotion::{self, PromotionOutcome, PromotionPlan, PROMOTION_PENDING_MESSAGE};
use super::status::{self, HealthResult, Observation, WorkloadObservation};
use super::sync::{sync_network_endpoint, sync_workload, SyncOutcome};
use crate::catalog::{entity_id, entity_properties, CatalogSync, NoopCatalog, PortCatalogClient};
use crate::config::ControllerConfig;
use crate::crd::{AppPhase, AtlasApp, AtlasAppStatus};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::health::{endpoint_url, HealthProbe, HttpHealthProbe};
use crate::retry::with_optimistic_retry;
use crate::workload::{build_desired_state, DesiredState};
use crate::{Error, CATALOG_FINALIZER, CONTROLLER_NAME};

/// Controller context shared by every reconcile
pub struct Context {
    /// Object store
    pub kube: Arc<dyn AppKubeClient>,
    /// Health prober for the application's Service
    pub health: Arc<dyn HealthProbe>,
    /// Catalog sync target
    pub catalog: Arc<dyn CatalogSync>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Controller configuration
    pub config: ControllerConfig,
    /// Cancelled when the process is shutting down
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new Context with the given dependencies
    pub fn new(
        kube: Arc<dyn AppKubeClient>,
        health: Arc<dyn HealthProbe>,
        catalog: Arc<dyn CatalogSync>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kube,
            health,
            catalog,
            events,
            config,
            shutdown,
        }
    }

    /// Create the production Context from a Kubernetes client
    ///
    /// Catalog sync uses the Port client when configured and is a no-op
    /// otherwise.
    pub fn from_client(
        client: Client,
        config: ControllerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, Error> {
        config.validate()?;

        let catalog: Arc<dyn CatalogSync> = match config.catalog() {
            Some(catalog) => {
                info!(url = %catalog.base_url, blueprint = %catalog.blueprint, "Catalog sync enabled");
                Arc::new(PortCatalogClient::new(catalog)?)
            }
            None => Arc::new(NoopCatalog),
        };

        Ok(Self {
            kube: Arc::new(AppKubeClientImpl::new(client.clone())),
            health: Arc::new(HttpHealthProbe::new(config.health_probe_timeout)?),
            catalog,
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            config,
            shutdown,
        })
    }

    /// Create a context for testing with a passing health probe and no-op sinks
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn AppKubeClient>) -> Self {
        use crate::events::NoopEventPublisher;
        use crate::health::MockHealthProbe;

        let mut health = MockHealthProbe::new();
        health.expect_probe().returning(|_| true);

        Self::new(
            kube,
            Arc::new(health),
            Arc::new(NoopCatalog),
            Arc::new(NoopEventPublisher),
            ControllerConfig::default(),
            CancellationToken::new(),
        )
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn publish(
        &self,
        app: &AtlasApp,
        type_: EventType,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        self.events
            .publish(&app.object_ref(&()), type_, reason, action, Some(note.into()))
            .await;
    }
}

/// Reconcile an AtlasApp
///
/// Deleted apps and shutdown end the reconcile quietly with
/// `Action::await_change()`. Conflicts and timeouts are returned as errors
/// and retried through [`error_policy`]. The whole pass, catalog cleanup
/// included, runs under the configured reconcile timeout.
#[instrument(
    skip(app, ctx),
    fields(app = %app.name_any(), namespace = %app.namespace().unwrap_or_default())
)]
pub async fn reconcile(app: Arc<AtlasApp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = app.name_any();
    let namespace = app
        .namespace()
        .ok_or_else(|| Error::validation(format!("AtlasApp {name} has no namespace")))?;

    let result = match tokio::time::timeout(
        ctx.config.reconcile_timeout,
        reconcile_app(&name, &namespace, &ctx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::timeout("reconcile")),
    };

    match result {
        Err(Error::Cancelled) => {
            debug!("shutdown requested, abandoning reconcile");
            Ok(Action::await_change())
        }
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "object disappeared mid-reconcile");
            Ok(Action::await_change())
        }
        other => other,
    }
}

async fn reconcile_app(name: &str, namespace: &str, ctx: &Arc<Context>) -> Result<Action, Error> {
    let Some(app) = ctx.kube.get_app(name, namespace).await? else {
        info!("AtlasApp deleted, removing catalog entity");
        spawn_catalog_delete(ctx, entity_id(name, namespace));
        return Ok(Action::await_change());
    };

    if app.metadata.deletion_timestamp.is_some() {
        return cleanup(&app, ctx).await;
    }
    if !has_finalizer(&app) {
        ctx.ensure_running()?;
        debug!("adding catalog finalizer");
        ctx.kube
            .add_app_finalizer(name, namespace, CATALOG_FINALIZER)
            .await?;
    }
    let prior = app.status.clone();

    info!(
        environment = %app.spec.environment,
        version = %app.spec.version,
        generation = ?app.metadata.generation,
        "reconciling AtlasApp"
    );

    // Approval gate
    let decision = approval::evaluate(&app.spec, prior.as_ref(), app.approved_version());
    match decision {
        GateDecision::Blocked { first_trip } => {
            return hold_for_approval(&app, prior.as_ref(), first_trip, ctx).await;
        }
        GateDecision::Approved { was_blocked: true } => {
            info!(version = %app.spec.version, "prod rollout approved");
            ctx.publish(
                &app,
                EventType::Normal,
                reasons::APPROVAL_GRANTED,
                actions::RECONCILE,
                format!("Version {} approved for production", app.spec.version),
            )
            .await;
        }
        GateDecision::Approved { was_blocked: false } | GateDecision::Proceed => {}
    }

    // Children
    let desired = build_desired_state(&app, &ctx.config.workload);
    let (workload, sync_error) = match sync_children(&desired, ctx).await {
        Ok(outcome) => (
            WorkloadObservation::from_deployment(outcome.object(), outcome.wrote()),
            None,
        ),
        Err(e) if e.is_conflict() || e.is_not_found() || matches!(e, Error::Cancelled) => {
            return Err(e)
        }
        Err(e) => {
            warn!(error = %e, "failed to synchronize children");
            (WorkloadObservation::default(), Some(e.to_string()))
        }
    };

    // Health
    let health = match app.spec.health_path() {
        Some(path) if sync_error.is_none() && workload.converged() => {
            probe_health(name, namespace, path, ctx).await?
        }
        _ => HealthResult::NotConfigured,
    };

    // Status
    let projection = status::project(&Observation {
        workload,
        sync_error,
        health,
    });
    let phase = projection.phase;
    let plan = promotion::plan(&app, phase);

    let mut next = projection.into_status();
    next.observed_generation = app.metadata.generation;
    next.promotion_pending = plan.is_pending();
    if next.promotion_pending {
        next.message = PROMOTION_PENDING_MESSAGE.to_string();
    }
    let written = persist_status(name, namespace, prior.as_ref(), next, ctx).await?;
    announce_phase(&app, prior.as_ref(), &written, ctx).await;

    // Promotion
    let written = match promote(&app, prior.as_ref(), plan, &written, ctx).await? {
        Some(failed) => failed,
        None => written,
    };

    spawn_catalog_upsert(&app, &written, ctx);
    Ok(requeue_for(written.phase, &ctx.config))
}

/// Persist `PendingApproval` without touching any child
async fn hold_for_approval(
    app: &AtlasApp,
    prior: Option<&AtlasAppStatus>,
    first_trip: bool,
    ctx: &Arc<Context>,
) -> Result<Action, Error> {
    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_default();

    let observed = ctx
        .kube
        .get_deployment(&name, &namespace)
        .await?
        .map(|d| WorkloadObservation::from_deployment(&d, false))
        .unwrap_or_default();

    let mut next = AtlasAppStatus::default()
        .phase(AppPhase::PendingApproval)
        .message(APPROVAL_MESSAGE)
        .replicas(observed.ready, observed.total);
    next.approval_required = true;
    next.observed_generation = app.metadata.generation;

    let written = persist_status(&name, &namespace, prior, next, ctx).await?;

    if first_trip {
        info!(version = %app.spec.version, "production deployment requires approval");
        ctx.publish(
            app,
            EventType::Warning,
            reasons::APPROVAL_REQUIRED,
            actions::RECONCILE,
            format!(
                "Version {} requires manual approval before rollout",
                app.spec.version
            ),
        )
        .await;
    }

    spawn_catalog_upsert(app, &written, ctx);
    Ok(requeue_for(written.phase, &ctx.config))
}

fn has_finalizer(app: &AtlasApp) -> bool {
    app.finalizers().iter().any(|f| f == CATALOG_FINALIZER)
}

/// Remove the catalog entity of a deleting app, then release it
///
/// A catalog that cannot be reached does not hold up the deletion; the
/// failure is logged and the finalizer released anyway.
async fn cleanup(app: &AtlasApp, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(app) {
        return Ok(Action::await_change());
    }
    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_default();
    let id = entity_id(&name, &namespace);

    info!(entity = %id, "AtlasApp deleting, removing catalog entity");
    if let Err(e) = ctx.catalog.delete(&id).await {
        warn!(entity = %id, error = %e, "catalog delete failed, releasing anyway");
    }

    ctx.ensure_running()?;
    ctx.kube
        .remove_app_finalizer(&name, &namespace, CATALOG_FINALIZER)
        .await?;
    Ok(Action::await_change())
}

async fn sync_children(
    desired: &DesiredState,
    ctx: &Context,
) -> Result<SyncOutcome<Deployment>, Error> {
    ctx.ensure_running()?;
    let workload = sync_workload(ctx.kube.as_ref(), &desired.deployment).await?;
    ctx.ensure_running()?;
    let endpoint = sync_network_endpoint(ctx.kube.as_ref(), &desired.service).await?;
    debug!(
        deployment = workload.label(),
        service = endpoint.label(),
        "children synchronized"
    );
    Ok(workload)
}

async fn probe_health(
    name: &str,
    namespace: &str,
    path: &str,
    ctx: &Context,
) -> Result<HealthResult, Error> {
    ctx.ensure_running()?;
    let url = endpoint_url(name, namespace, ctx.config.workload.container_port, path);
    debug!(url = %url, "performing health check");

    let probe = tokio::time::timeout(ctx.config.health_probe_timeout, ctx.health.probe(&url));
    tokio::select! {
        _ = ctx.shutdown.cancelled() => Err(Error::Cancelled),
        outcome = probe => Ok(match outcome {
            Ok(true) => HealthResult::Passed,
            Ok(false) => HealthResult::Failed,
            Err(_) => {
                debug!(url = %url, "health check timed out");
                HealthResult::Failed
            }
        }),
    }
}

/// Finalize and write status, skipping the write when nothing changed
///
/// Conflicting writes are retried against a fresh read up to the configured
/// bound.
async fn persist_status(
    name: &str,
    namespace: &str,
    prior: Option<&AtlasAppStatus>,
    next: AtlasAppStatus,
    ctx: &Context,
) -> Result<AtlasAppStatus, Error> {
    let finalized = status::finalize(prior, next, Utc::now());
    if prior == Some(&finalized) {
        debug!(phase = %finalized.phase, "status unchanged, skipping write");
        return Ok(finalized);
    }

    ctx.ensure_running()?;
    let kube = ctx.kube.as_ref();
    let status = &finalized;
    with_optimistic_retry(
        ctx.config.conflict_retry_attempts,
        "patch_status",
        move || async move {
            kube.get_app(name, namespace)
                .await?
                .ok_or_else(|| Error::not_found("AtlasApp", format!("{namespace}/{name}")))
        },
        move |current: AtlasApp| async move {
            kube.patch_app_status(name, namespace, current.resource_version(), status)
                .await
        },
    )
    .await?;

    info!(
        phase = %finalized.phase,
        ready = finalized.ready,
        message = %finalized.message,
        "status updated"
    );
    Ok(finalized)
}

/// Emit an event when the phase moved somewhere worth telling a human about
async fn announce_phase(
    app: &AtlasApp,
    prior: Option<&AtlasAppStatus>,
    written: &AtlasAppStatus,
    ctx: &Context,
) {
    if prior.map(|p| p.phase) == Some(written.phase) {
        return;
    }
    let (type_, reason) = match written.phase {
        AppPhase::Ready => (EventType::Normal, reasons::DEPLOYED),
        AppPhase::Unhealthy => (EventType::Warning, reasons::UNHEALTHY),
        AppPhase::Failed => (EventType::Warning, reasons::SYNC_FAILED),
        _ => return,
    };
    ctx.publish(app, type_, reason, actions::SYNC, written.message.clone())
        .await;
}

/// Carry out the promotion plan
///
/// Returns the rewritten status when writing the sibling failed
/// transiently, `None` otherwise.
async fn promote(
    app: &AtlasApp,
    prior: Option<&AtlasAppStatus>,
    plan: PromotionPlan,
    written: &AtlasAppStatus,
    ctx: &Context,
) -> Result<Option<AtlasAppStatus>, Error> {
    match plan {
        PromotionPlan::None => Ok(None),
        PromotionPlan::AwaitManual { target } => {
            if !prior.is_some_and(|p| p.promotion_pending) {
                info!(target = %target, "promotion to production requires approval");
                ctx.publish(
                    app,
                    EventType::Normal,
                    reasons::PROMOTION_PENDING,
                    actions::PROMOTE,
                    format!(
                        "Promotion of {} to {target} requires manual approval",
                        app.spec.version
                    ),
                )
                .await;
            }
            Ok(None)
        }
        PromotionPlan::Halted { reason } => {
            warn!(reason = %reason, "promotion halted");
            ctx.publish(
                app,
                EventType::Warning,
                reasons::PROMOTION_HALTED,
                actions::PROMOTE,
                reason,
            )
            .await;
            Ok(None)
        }
        PromotionPlan::Sibling(sibling) => {
            ctx.ensure_running()?;
            let target = sibling.spec.environment.clone();
            match promotion::execute(ctx.kube.as_ref(), &sibling).await {
                Ok(PromotionOutcome::UpToDate) => Ok(None),
                Ok(PromotionOutcome::Created(_) | PromotionOutcome::Updated(_)) => {
                    ctx.publish(
                        app,
                        EventType::Normal,
                        reasons::PROMOTED,
                        actions::PROMOTE,
                        format!("Promoted version {} to {target}", app.spec.version),
                    )
                    .await;
                    Ok(None)
                }
                Err(e) if e.is_conflict() || matches!(e, Error::Cancelled) => Err(e),
                Err(e) => {
                    error!(target = %target, error = %e, "promotion failed");
                    let failed = written
                        .clone()
                        .phase(AppPhase::Failed)
                        .message(format!("Promotion to {target} failed: {e}"));
                    let name = app.name_any();
                    let namespace = app.namespace().unwrap_or_default();
                    let failed =
                        persist_status(&name, &namespace, Some(written), failed, ctx).await?;
                    ctx.publish(
                        app,
                        EventType::Warning,
                        reasons::PROMOTION_FAILED,
                        actions::PROMOTE,
                        failed.message.clone(),
                    )
                    .await;
                    Ok(Some(failed))
                }
            }
        }
    }
}

fn spawn_catalog_upsert(app: &AtlasApp, written: &AtlasAppStatus, ctx: &Arc<Context>) {
    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_default();
    let id = entity_id(&name, &namespace);
    let properties = entity_properties(
        &name,
        &namespace,
        &app.spec,
        written,
        ctx.config.workload.container_port,
    );
    let catalog = ctx.catalog.clone();
    tokio::spawn(async move {
        if let Err(e) = catalog.upsert(&id, &properties).await {
            warn!(entity = %id, error = %e, "catalog sync failed");
        }
    });
}

fn spawn_catalog_delete(ctx: &Arc<Context>, id: String) {
    let catalog = ctx.catalog.clone();
    tokio::spawn(async move {
        if let Err(e) = catalog.delete(&id).await {
            warn!(entity = %id, error = %e, "catalog delete failed");
        }
    });
}

fn requeue_for(phase: AppPhase, config: &ControllerConfig) -> Action {
    if phase.is_converging() {
        Action::requeue(config.converging_requeue)
    } else if phase == AppPhase::PendingApproval {
        Action::requeue(config.approval_recheck)
    } else {
        Action::requeue(config.stable_recheck)
    }
}

/// Error policy for the controller
///
/// Every failed reconcile is retried after the configured fixed delay.
pub fn error_policy(app: Arc<AtlasApp>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(error = %error, app = %app.key(), "reconciliation failed, will retry");
    } else {
        error!(error = %error, app = %app.key(), "reconciliation failed");
    }
    Action::requeue(ctx.config.error_requeue)
}

#[cfg(test)]
#[path = "application_tests.rs"]
mod tests;
