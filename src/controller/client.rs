//! Object-store access for the AtlasApp controller
//!
//! [`AppKubeClient`] is the only way the reconciler touches the API server.
//! Every failure leaving this module has already been classified by
//! [`Error::from_kube`], so callers match on `NotFound`, `Conflict` and
//! `AlreadyExists` rather than on raw status codes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;

use crate::crd::{AtlasApp, AtlasAppStatus};
use crate::{Error, CONTROLLER_NAME};

/// Trait abstracting Kubernetes client operations for AtlasApp
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppKubeClient: Send + Sync {
    /// Get an AtlasApp by name and namespace
    async fn get_app(&self, name: &str, namespace: &str) -> Result<Option<AtlasApp>, Error>;

    /// Create an AtlasApp
    async fn create_app(&self, app: &AtlasApp) -> Result<AtlasApp, Error>;

    /// Replace an AtlasApp; the object's resourceVersion guards the write
    async fn replace_app(&self, app: &AtlasApp) -> Result<AtlasApp, Error>;

    /// Merge-patch the status subresource, optionally guarded by a resourceVersion
    async fn patch_app_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &AtlasAppStatus,
    ) -> Result<AtlasApp, Error>;

    /// Add a finalizer to an AtlasApp; a no-op when already present
    async fn add_app_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer from an AtlasApp
    async fn remove_app_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Get a Deployment by name and namespace
    async fn get_deployment(&self, name: &str, namespace: &str)
        -> Result<Option<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Replace a Deployment; the object's resourceVersion guards the write
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Get a Service by name and namespace
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Replace a Service; the object's resourceVersion guards the write
    async fn replace_service(&self, service: &Service) -> Result<Service, Error>;
}

/// Real Kubernetes client implementation
pub struct AppKubeClientImpl {
    client: Client,
}

impl AppKubeClientImpl {
    /// Create a new AppKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }

    /// Write the finalizer list computed by `edit` from the current one
    ///
    /// The patch carries the resourceVersion it was computed from, so a
    /// concurrent finalizer change surfaces as a conflict.
    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<(), Error> {
        let api: Api<AtlasApp> = Api::namespaced(self.client.clone(), namespace);
        let Some(app) = get_opt(api.clone(), "AtlasApp", name, namespace).await? else {
            return Ok(());
        };

        let mut finalizers = app.finalizers().to_vec();
        if !edit(&mut finalizers) {
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": app.resource_version(),
                "finalizers": finalizers,
            }
        });
        api.patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube("AtlasApp", format!("{namespace}/{name}"), e))?;
        Ok(())
    }
}

/// Name and namespace of an object about to be written
fn identity<K: ResourceExt>(kind: &str, obj: &K) -> Result<(String, String), Error> {
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::validation(format!("{kind} {} has no namespace", obj.name_any())))?;
    Ok((obj.name_any(), namespace))
}

async fn get_opt<K>(api: Api<K>, kind: &str, name: &str, namespace: &str) -> Result<Option<K>, Error>
where
    K: Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) => match Error::from_kube(kind, format!("{namespace}/{name}"), e) {
            Error::NotFound { .. } => Ok(None),
            other => Err(other),
        },
    }
}

#[async_trait]
impl AppKubeClient for AppKubeClientImpl {
    async fn get_app(&self, name: &str, namespace: &str) -> Result<Option<AtlasApp>, Error> {
        let api: Api<AtlasApp> = Api::namespaced(self.client.clone(), namespace);
        get_opt(api, "AtlasApp", name, namespace).await
    }

    async fn create_app(&self, app: &AtlasApp) -> Result<AtlasApp, Error> {
        let (name, namespace) = identity("AtlasApp", app)?;
        let api: Api<AtlasApp> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), app)
            .await
            .map_err(|e| Error::from_kube("AtlasApp", format!("{namespace}/{name}"), e))
    }

    async fn replace_app(&self, app: &AtlasApp) -> Result<AtlasApp, Error> {
        let (name, namespace) = identity("AtlasApp", app)?;
        let api: Api<AtlasApp> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(), app)
            .await
            .map_err(|e| Error::from_kube("AtlasApp", format!("{namespace}/{name}"), e))
    }

    async fn patch_app_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &AtlasAppStatus,
    ) -> Result<AtlasApp, Error> {
        let api: Api<AtlasApp> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = match resource_version {
            Some(rv) => serde_json::json!({
                "metadata": { "resourceVersion": rv },
                "status": status,
            }),
            None => serde_json::json!({ "status": status }),
        };
        api.patch_status(name, &Self::patch_params(), &Patch::Merge(&status_patch))
            .await
            .map_err(|e| Error::from_kube("AtlasApp", format!("{namespace}/{name}"), e))
    }

    async fn add_app_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(name, namespace, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_app_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(name, namespace, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }

    async fn get_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        get_opt(api, "Deployment", name, namespace).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let (name, namespace) = identity("Deployment", deployment)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), deployment)
            .await
            .map_err(|e| Error::from_kube("Deployment", format!("{namespace}/{name}"), e))
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let (name, namespace) = identity("Deployment", deployment)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(), deployment)
            .await
            .map_err(|e| Error::from_kube("Deployment", format!("{namespace}/{name}"), e))
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        get_opt(api, "Service", name, namespace).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let (name, namespace) = identity("Service", service)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), service)
            .await
            .map_err(|e| Error::from_kube("Service", format!("{namespace}/{name}"), e))
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, Error> {
        let (name, namespace) = identity("Service", service)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(), service)
            .await
            .map_err(|e| Error::from_kube("Service", format!("{namespace}/{name}"), e))
    }
}
