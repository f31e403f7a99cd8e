//! Controller wiring
//!
//! Watches AtlasApps plus the Deployments and Services they own, so a change
//! to any child re-queues its parent.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::application::{error_policy, reconcile, Context};
use crate::config::ControllerConfig;
use crate::crd::AtlasApp;
use crate::Error;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the AtlasApp controller until `shutdown` is cancelled
///
/// In-flight reconciles are allowed to finish; new ones are not started once
/// shutdown begins.
pub async fn run_controller(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let concurrency = config.concurrency;
    let ctx = Arc::new(Context::from_client(
        client.clone(),
        config,
        shutdown.clone(),
    )?);

    let apps: Api<AtlasApp> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);

    info!(concurrency, "starting AtlasApp controller");

    Controller::new(apps, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(
            deployments,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns(services, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(ControllerRuntimeConfig::default().concurrency(concurrency))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("AtlasApp"))
        .await;

    info!("AtlasApp controller stopped");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
