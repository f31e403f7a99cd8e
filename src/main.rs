//! Atlas Operator - environment promotion for AtlasApp resources

use std::time::Duration;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use atlas::config::{ControllerConfig, DEFAULT_CATALOG_BLUEPRINT};
use atlas::controller::run_controller;
use atlas::crd::AtlasApp;
use atlas::retry::{retry_with_backoff, RetryConfig};
use atlas::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use atlas::workload::WorkloadTemplate;
use atlas::CONTROLLER_NAME;

/// Atlas - promotes AtlasApp releases through dev, stage and prod
#[derive(Parser, Debug)]
#[command(name = "atlas", version, about, long_about = None)]
struct Cli {
    /// Print the AtlasApp CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Do not install or update the CRD on startup
    #[arg(long, env = "ATLAS_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,

    /// Log line format
    #[arg(long, env = "ATLAS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Log filter directive (RUST_LOG takes precedence)
    #[arg(long, env = "ATLAS_LOG_FILTER")]
    log_filter: Option<String>,

    /// Maximum concurrent reconciles
    #[arg(long, env = "ATLAS_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,

    /// Deadline for one reconcile, in seconds
    #[arg(long, env = "ATLAS_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    reconcile_timeout_secs: u64,

    /// Deadline for one health probe, in seconds
    #[arg(long, env = "ATLAS_HEALTH_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    health_probe_timeout_secs: u64,

    /// Recheck interval for Ready apps, in seconds
    #[arg(long, env = "ATLAS_STABLE_RECHECK_SECS", default_value_t = 300)]
    stable_recheck_secs: u64,

    /// Recheck interval while waiting on approval, in seconds
    #[arg(long, env = "ATLAS_APPROVAL_RECHECK_SECS", default_value_t = 300)]
    approval_recheck_secs: u64,

    /// Requeue interval while an app converges, in seconds
    #[arg(long, env = "ATLAS_CONVERGING_REQUEUE_SECS", default_value_t = 30)]
    converging_requeue_secs: u64,

    /// Requeue interval after a reconcile error, in seconds
    #[arg(long, env = "ATLAS_ERROR_REQUEUE_SECS", default_value_t = 30)]
    error_requeue_secs: u64,

    /// Attempts for a conflicting status write
    #[arg(long, env = "ATLAS_CONFLICT_RETRY_ATTEMPTS", default_value_t = 5)]
    conflict_retry_attempts: u32,

    /// Image repository; the app's version is used as the tag
    #[arg(long, env = "ATLAS_IMAGE_REPOSITORY", default_value = "nginx")]
    image_repository: String,

    /// Port the application container listens on
    #[arg(long, env = "ATLAS_CONTAINER_PORT", default_value_t = 80)]
    container_port: i32,

    /// Catalog API base URL; catalog sync is off when unset
    #[arg(long, env = "ATLAS_CATALOG_URL")]
    catalog_url: Option<String>,

    /// Catalog OAuth client id
    #[arg(long, env = "ATLAS_CATALOG_CLIENT_ID")]
    catalog_client_id: Option<String>,

    /// Catalog OAuth client secret
    #[arg(long, env = "ATLAS_CATALOG_CLIENT_SECRET", hide_env_values = true)]
    catalog_client_secret: Option<String>,

    /// Catalog blueprint entities are written under
    #[arg(long, env = "ATLAS_CATALOG_BLUEPRINT", default_value = DEFAULT_CATALOG_BLUEPRINT)]
    catalog_blueprint: String,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            concurrency: self.concurrency,
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            health_probe_timeout: Duration::from_secs(self.health_probe_timeout_secs),
            stable_recheck: Duration::from_secs(self.stable_recheck_secs),
            approval_recheck: Duration::from_secs(self.approval_recheck_secs),
            converging_requeue: Duration::from_secs(self.converging_requeue_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            conflict_retry_attempts: self.conflict_retry_attempts,
            workload: WorkloadTemplate {
                image_repository: self.image_repository.clone(),
                container_port: self.container_port,
            },
            catalog_url: self.catalog_url.clone(),
            catalog_client_id: self.catalog_client_id.clone(),
            catalog_client_secret: self.catalog_client_secret.clone(),
            catalog_blueprint: self.catalog_blueprint.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&AtlasApp::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        filter: cli.log_filter.clone(),
    })?;

    let config = cli.controller_config();
    config.validate()?;
    tracing::info!(
        concurrency = config.concurrency,
        image_repository = %config.workload.image_repository,
        catalog = config.catalog_url.is_some(),
        "Starting Atlas controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        retry_with_backoff(
            &RetryConfig::with_max_attempts(5),
            "install_crd",
            || ensure_crd_installed(&client),
        )
        .await?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    run_controller(client, config, shutdown).await?;
    tracing::info!("Shutting down");
    Ok(())
}

/// Install or update the AtlasApp CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();
    let crd = AtlasApp::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    tracing::info!(crd = %name, "Installing AtlasApp CRD...");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install AtlasApp CRD: {}", e))?;
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to listen for ctrl-c");
                return;
            }
            tracing::info!("Received SIGINT");
        }
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
    token.cancel();
}
