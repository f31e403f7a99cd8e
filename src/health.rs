//! HTTP health probing of an application's Service
//!
//! A probe either passes or it does not: connection errors, timeouts and
//! non-2xx responses all count as a failed check and are never surfaced as
//! reconcile errors.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::Error;

/// Probes an HTTP endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True when `url` answered with a success status
    async fn probe(&self, url: &str) -> bool;
}

/// Probe backed by a reqwest client with a fixed timeout
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Build a probe whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("health_probe", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(url, status = %resp.status(), "Health check returned failure status");
                false
            }
            Err(e) => {
                debug!(url, error = %e, "Health check request failed");
                false
            }
        }
    }
}

/// In-cluster URL of the application's health endpoint
pub fn endpoint_url(name: &str, namespace: &str, port: i32, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("http://{name}.{namespace}.svc.cluster.local:{port}{path}")
}
