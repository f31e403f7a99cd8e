//! Child resource synchronization
//!
//! Converges one desired child against the live object. The controller owns a
//! small set of fields on each child; only those are compared, and a drifted
//! child is fixed by copying the owned fields onto the live object and
//! replacing it with the live resourceVersion. Anything else on the live
//! object (annotations, extra env vars, sidecars) is left alone.
//!
//! Each call makes at most one create or replace.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{EnvVar, Service};
use kube::ResourceExt;
use tracing::{debug, info};

use super::client::AppKubeClient;
use crate::workload::{
    app_container, container_port, env_value, APP_CONTAINER, MIGRATION_ID_ENV, VERSION_LABEL,
};
use crate::Error;

/// What synchronizing a child did
#[derive(Clone, Debug, PartialEq)]
pub enum SyncOutcome<K> {
    /// The child did not exist and was created
    Created(K),
    /// An owned field had drifted and the child was replaced
    Updated(K),
    /// The child already matched
    Unchanged(K),
    /// Another writer created the child first; it was re-read and used as is
    Adopted(K),
}

impl<K> SyncOutcome<K> {
    /// The child as last seen
    pub fn object(&self) -> &K {
        match self {
            Self::Created(k) | Self::Updated(k) | Self::Unchanged(k) | Self::Adopted(k) => k,
        }
    }

    /// True when this call wrote to the API server
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created(_) | Self::Updated(_))
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Unchanged(_) => "unchanged",
            Self::Adopted(_) => "adopted",
        }
    }
}

fn identity<K: ResourceExt>(obj: &K) -> (String, String) {
    (obj.name_any(), obj.namespace().unwrap_or_default())
}

/// Converge the Deployment
pub async fn sync_workload(
    kube: &dyn AppKubeClient,
    desired: &Deployment,
) -> Result<SyncOutcome<Deployment>, Error> {
    let (name, namespace) = identity(desired);

    let Some(live) = kube.get_deployment(&name, &namespace).await? else {
        return match kube.create_deployment(desired).await {
            Ok(created) => {
                info!(deployment = %name, namespace = %namespace, "Created deployment");
                Ok(SyncOutcome::Created(created))
            }
            Err(Error::AlreadyExists { .. }) => {
                let live = kube
                    .get_deployment(&name, &namespace)
                    .await?
                    .ok_or_else(|| {
                        Error::transient(
                            "Deployment",
                            format!("{namespace}/{name}"),
                            "deleted after create reported AlreadyExists",
                        )
                    })?;
                debug!(deployment = %name, namespace = %namespace, "Adopted concurrently created deployment");
                Ok(SyncOutcome::Adopted(live))
            }
            Err(e) => Err(e),
        };
    };

    match patch_workload(&live, desired) {
        None => Ok(SyncOutcome::Unchanged(live)),
        Some(patched) => {
            let updated = kube.replace_deployment(&patched).await?;
            info!(deployment = %name, namespace = %namespace, "Corrected deployment drift");
            Ok(SyncOutcome::Updated(updated))
        }
    }
}

/// Converge the Service
pub async fn sync_network_endpoint(
    kube: &dyn AppKubeClient,
    desired: &Service,
) -> Result<SyncOutcome<Service>, Error> {
    let (name, namespace) = identity(desired);

    let Some(live) = kube.get_service(&name, &namespace).await? else {
        return match kube.create_service(desired).await {
            Ok(created) => {
                info!(service = %name, namespace = %namespace, "Created service");
                Ok(SyncOutcome::Created(created))
            }
            Err(Error::AlreadyExists { .. }) => {
                let live = kube.get_service(&name, &namespace).await?.ok_or_else(|| {
                    Error::transient(
                        "Service",
                        format!("{namespace}/{name}"),
                        "deleted after create reported AlreadyExists",
                    )
                })?;
                debug!(service = %name, namespace = %namespace, "Adopted concurrently created service");
                Ok(SyncOutcome::Adopted(live))
            }
            Err(e) => Err(e),
        };
    };

    match patch_endpoint(&live, desired) {
        None => Ok(SyncOutcome::Unchanged(live)),
        Some(patched) => {
            let updated = kube.replace_service(&patched).await?;
            info!(service = %name, namespace = %namespace, "Corrected service drift");
            Ok(SyncOutcome::Updated(updated))
        }
    }
}

/// Copy the owned workload fields onto `live`; `None` when nothing drifted
///
/// Owned: replicas, the version label on the Deployment and its pod
/// template, and on the `app` container the image, the `MIGRATION_ID` value
/// and the first container port. A missing `app` container is appended.
pub fn patch_workload(live: &Deployment, desired: &Deployment) -> Option<Deployment> {
    let want = app_container(desired)?;
    let want_replicas = desired.spec.as_ref().and_then(|s| s.replicas);
    let want_version = desired.labels().get(VERSION_LABEL).cloned();

    let mut patched = live.clone();
    let mut changed = false;

    if let Some(version) = &want_version {
        changed |= set_label(&mut patched.metadata.labels, VERSION_LABEL, version);
    }

    let spec = patched.spec.get_or_insert_with(Default::default);
    if spec.replicas != want_replicas {
        spec.replicas = want_replicas;
        changed = true;
    }

    if let Some(version) = &want_version {
        let template = spec.template.metadata.get_or_insert_with(Default::default);
        changed |= set_label(&mut template.labels, VERSION_LABEL, version);
    }

    let pod = spec.template.spec.get_or_insert_with(Default::default);
    let Some(have) = pod.containers.iter_mut().find(|c| c.name == APP_CONTAINER) else {
        pod.containers.push(want.clone());
        return Some(patched);
    };

    if have.image != want.image {
        have.image = want.image.clone();
        changed = true;
    }

    let want_migration = env_value(want, MIGRATION_ID_ENV).map(str::to_string);
    if env_value(have, MIGRATION_ID_ENV) != want_migration.as_deref() {
        let env = have.env.get_or_insert_with(Vec::new);
        match env.iter_mut().find(|e| e.name == MIGRATION_ID_ENV) {
            Some(var) => {
                var.value = want_migration;
                var.value_from = None;
            }
            None => env.push(EnvVar {
                name: MIGRATION_ID_ENV.to_string(),
                value: want_migration,
                ..Default::default()
            }),
        }
        changed = true;
    }

    if let Some(port) = container_port(want) {
        if container_port(have) != Some(port) {
            match have.ports.as_mut().and_then(|p| p.first_mut()) {
                Some(first) => first.container_port = port,
                None => have.ports = want.ports.clone(),
            }
            changed = true;
        }
    }

    changed.then_some(patched)
}

/// Set `key` to `value`; true when the label changed
fn set_label(labels: &mut Option<BTreeMap<String, String>>, key: &str, value: &str) -> bool {
    let labels = labels.get_or_insert_with(BTreeMap::new);
    if labels.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    labels.insert(key.to_string(), value.to_string());
    true
}

/// Copy the owned service fields onto `live`; `None` when nothing drifted
///
/// Owned: `port` and `targetPort` of the first port.
pub fn patch_endpoint(live: &Service, desired: &Service) -> Option<Service> {
    let want = desired.spec.as_ref()?.ports.as_ref()?.first()?;

    let mut patched = live.clone();
    let spec = patched.spec.get_or_insert_with(Default::default);
    let ports = spec.ports.get_or_insert_with(Vec::new);

    match ports.first_mut() {
        None => {
            ports.push(want.clone());
            Some(patched)
        }
        Some(have) if have.port != want.port || have.target_port != want.target_port => {
            have.port = want.port;
            have.target_port = want.target_port.clone();
            Some(patched)
        }
        Some(_) => None,
    }
}
