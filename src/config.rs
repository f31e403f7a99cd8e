//! Controller configuration
//!
//! The binary fills a [`ControllerConfig`] from command-line flags and
//! `ATLAS_*` environment variables; everything else receives it through the
//! reconcile context. [`ControllerConfig::validate`] rejects combinations the
//! reconcile loop cannot honor.

use std::fmt;
use std::time::Duration;

use crate::workload::WorkloadTemplate;
use crate::Error;

/// Default blueprint name for catalog entities
pub const DEFAULT_CATALOG_BLUEPRINT: &str = "atlasApp";

/// Settings for the catalog-sync client
#[derive(Clone, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Catalog API base URL
    pub base_url: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Blueprint entities are written under
    pub blueprint: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("blueprint", &self.blueprint)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Runtime configuration of the AtlasApp controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Maximum reconciles running at once across all keys
    pub concurrency: u16,
    /// Deadline for one whole reconcile
    pub reconcile_timeout: Duration,
    /// Deadline for one health probe
    pub health_probe_timeout: Duration,
    /// Requeue after a Ready reconcile with nothing left to do
    pub stable_recheck: Duration,
    /// Requeue while waiting on a manual approval
    pub approval_recheck: Duration,
    /// Requeue while Deploying, Unhealthy or Failed
    pub converging_requeue: Duration,
    /// Requeue after a reconcile error
    pub error_requeue: Duration,
    /// Attempts for a conflicting status write
    pub conflict_retry_attempts: u32,
    /// Image and port of the generated workload
    pub workload: WorkloadTemplate,
    /// Catalog API base URL
    pub catalog_url: Option<String>,
    /// Catalog client id
    pub catalog_client_id: Option<String>,
    /// Catalog client secret
    pub catalog_client_secret: Option<String>,
    /// Catalog blueprint
    pub catalog_blueprint: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            reconcile_timeout: Duration::from_secs(60),
            health_probe_timeout: Duration::from_secs(5),
            stable_recheck: Duration::from_secs(300),
            approval_recheck: Duration::from_secs(300),
            converging_requeue: Duration::from_secs(30),
            error_requeue: Duration::from_secs(30),
            conflict_retry_attempts: 5,
            workload: WorkloadTemplate::default(),
            catalog_url: None,
            catalog_client_id: None,
            catalog_client_secret: None,
            catalog_blueprint: DEFAULT_CATALOG_BLUEPRINT.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Check the configuration for combinations that cannot work
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency == 0 {
            return Err(Error::validation("concurrency must be at least 1"));
        }
        if self.conflict_retry_attempts == 0 {
            return Err(Error::validation(
                "conflict retry attempts must be at least 1",
            ));
        }
        if self.health_probe_timeout >= self.reconcile_timeout {
            return Err(Error::validation(format!(
                "health probe timeout ({:?}) must be shorter than the reconcile timeout ({:?})",
                self.health_probe_timeout, self.reconcile_timeout
            )));
        }
        if !(1..=65535).contains(&self.workload.container_port) {
            return Err(Error::validation(format!(
                "container port {} is out of range",
                self.workload.container_port
            )));
        }
        if self.workload.image_repository.is_empty() {
            return Err(Error::validation("image repository must not be empty"));
        }

        let catalog_fields = [
            self.catalog_url.is_some(),
            self.catalog_client_id.is_some(),
            self.catalog_client_secret.is_some(),
        ];
        if catalog_fields.iter().any(|set| *set) && !catalog_fields.iter().all(|set| *set) {
            return Err(Error::validation(
                "catalog url, client id and client secret must be set together",
            ));
        }
        Ok(())
    }

    /// Catalog settings, when catalog sync is configured
    pub fn catalog(&self) -> Option<CatalogConfig> {
        Some(CatalogConfig {
            base_url: self.catalog_url.clone()?,
            client_id: self.catalog_client_id.clone()?,
            client_secret: self.catalog_client_secret.clone()?,
            blueprint: self.catalog_blueprint.clone(),
            request_timeout: self.health_probe_timeout.max(Duration::from_secs(10)),
        })
    }
}
