//! Catalog synchronization
//!
//! After each successful reconcile the controller mirrors the application's
//! state into an external software catalog (a Port-style entity API). This is
//! best-effort: the reconcile never waits on it and failures are only logged.
//! When the AtlasApp is deleted its catalog entity is deleted too.

use async_trait::async_trait;
use chrono::SecondsFormat;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::CatalogConfig;
use crate::crd::{AppPhase, AtlasAppSpec, AtlasAppStatus};
use crate::health::endpoint_url;
use crate::Error;

/// Properties describing one catalog entity
pub type EntityProperties = Map<String, Value>;

/// Writes application entities to a catalog
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CatalogSync: Send + Sync {
    /// Create or update an entity
    async fn upsert(&self, entity_id: &str, properties: &EntityProperties) -> Result<(), Error>;

    /// Delete an entity; deleting a missing entity succeeds
    async fn delete(&self, entity_id: &str) -> Result<(), Error>;
}

/// Catalog that accepts and discards everything
pub struct NoopCatalog;

#[async_trait]
impl CatalogSync for NoopCatalog {
    async fn upsert(&self, _entity_id: &str, _properties: &EntityProperties) -> Result<(), Error> {
        Ok(())
    }

    async fn delete(&self, _entity_id: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// Catalog entity identifier for an application
pub fn entity_id(name: &str, namespace: &str) -> String {
    format!("{name}-{namespace}")
}

/// Catalog properties for an application and its current status
pub fn entity_properties(
    name: &str,
    namespace: &str,
    spec: &AtlasAppSpec,
    status: &AtlasAppStatus,
    port: i32,
) -> EntityProperties {
    let mut props = Map::new();
    props.insert("environment".into(), json!(spec.environment));
    props.insert("version".into(), json!(spec.version));
    props.insert("migrationId".into(), json!(spec.migration_id));
    props.insert("phase".into(), json!(status.phase.to_string()));
    props.insert("ready".into(), json!(status.ready));
    props.insert(
        "replicas".into(),
        json!(format!("{}/{}", status.ready_replicas, status.total_replicas)),
    );
    props.insert("namespace".into(), json!(namespace));
    if let Some(ts) = status.last_update {
        props.insert(
            "lastUpdate".into(),
            json!(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }
    if status.phase == AppPhase::Ready {
        props.insert("url".into(), json!(endpoint_url(name, namespace, port, "/")));
    }
    props
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
}

/// Client for a Port-style entity catalog
///
/// Authenticates with client credentials on first use and caches the token.
/// A 401 drops the cached token so the next call authenticates again.
pub struct PortCatalogClient {
    http: reqwest::Client,
    config: CatalogConfig,
    token: Mutex<Option<String>>,
}

impl PortCatalogClient {
    /// Build a client for the configured catalog
    pub fn new(config: CatalogConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::catalog(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn entities_url(&self) -> String {
        format!("{}/v1/blueprints/{}/entities", self.base(), self.config.blueprint)
    }

    async fn token(&self) -> Result<String, Error> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let resp = self
            .http
            .post(format!("{}/v1/auth/access_token", self.base()))
            .json(&json!({
                "clientId": self.config.client_id,
                "clientSecret": self.config.client_secret,
            }))
            .send()
            .await
            .map_err(|e| Error::catalog(format!("authentication request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::catalog(format!(
                "authentication failed with status {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::catalog(format!("invalid token response: {e}")))?;
        debug!("Authenticated with catalog");
        *cached = Some(body.access_token.clone());
        Ok(body.access_token)
    }

    async fn forget_token_on_401(&self, status: StatusCode) {
        if status == StatusCode::UNAUTHORIZED {
            *self.token.lock().await = None;
        }
    }
}

#[async_trait]
impl CatalogSync for PortCatalogClient {
    async fn upsert(&self, entity_id: &str, properties: &EntityProperties) -> Result<(), Error> {
        let token = self.token().await?;
        let entity = json!({
            "identifier": entity_id,
            "title": entity_id,
            "blueprint": self.config.blueprint,
            "properties": properties,
        });

        let patched = self
            .http
            .patch(format!("{}/{}", self.entities_url(), entity_id))
            .bearer_auth(&token)
            .json(&entity)
            .send()
            .await;
        match patched {
            Ok(resp) if resp.status().is_success() => {
                debug!(entity = %entity_id, "Updated catalog entity");
                return Ok(());
            }
            Ok(resp) => self.forget_token_on_401(resp.status()).await,
            Err(e) => debug!(entity = %entity_id, error = %e, "Catalog update failed, creating"),
        }

        let resp = self
            .http
            .post(self.entities_url())
            .bearer_auth(&token)
            .json(&entity)
            .send()
            .await
            .map_err(|e| Error::catalog(format!("create {entity_id} failed: {e}")))?;

        if resp.status().is_success() {
            info!(entity = %entity_id, "Created catalog entity");
            Ok(())
        } else {
            self.forget_token_on_401(resp.status()).await;
            Err(Error::catalog(format!(
                "create {entity_id} failed with status {}",
                resp.status()
            )))
        }
    }

    async fn delete(&self, entity_id: &str) -> Result<(), Error> {
        let token = self.token().await?;
        let resp = self
            .http
            .delete(format!("{}/{}", self.entities_url(), entity_id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| Error::catalog(format!("delete {entity_id} failed: {e}")))?;

        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => {
                info!(entity = %entity_id, "Deleted catalog entity");
                Ok(())
            }
            s => {
                self.forget_token_on_401(s).await;
                Err(Error::catalog(format!(
                    "delete {entity_id} failed with status {s}"
                )))
            }
        }
    }
}
