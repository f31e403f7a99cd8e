//! In-memory object store for reconcile tests
//!
//! `FakeKube` behaves like a tiny API server: objects carry resourceVersions,
//! guarded writes conflict on stale versions, creates of existing objects
//! return AlreadyExists, and every mutating call is recorded so tests can
//! assert how many writes a reconcile made. Failures can be injected per
//! operation. `RecordingEvents` and `RecordingCatalog` capture what the
//! reconcile told the outside world.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::runtime::events::EventType;
use kube::ResourceExt;

use super::client::AppKubeClient;
use crate::catalog::{CatalogSync, EntityProperties};
use crate::crd::{AtlasApp, AtlasAppStatus};
use crate::events::EventPublisher;
use crate::Error;

type Key = (String, String);

type AppEdit = Box<dyn FnOnce(&mut AtlasApp) + Send>;

fn key_of<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn key(name: &str, namespace: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn display((namespace, name): &Key) -> String {
    format!("{namespace}/{name}")
}

#[derive(Default)]
struct State {
    apps: HashMap<Key, AtlasApp>,
    deployments: HashMap<Key, Deployment>,
    services: HashMap<Key, Service>,
    next_version: u64,
    writes: Vec<String>,
    status_conflicts: u32,
    fail_deployment_create: bool,
    fail_app_writes: bool,
    race_deployment_create: bool,
    conflict_deployment_replace: bool,
    edit_before_status_patch: Option<AppEdit>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory `AppKubeClient`
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<State>,
}

impl FakeKube {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an app as if a user had applied it
    pub fn insert_app(&self, mut app: AtlasApp) -> AtlasApp {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        app.metadata.resource_version = Some(rv);
        app.metadata.generation = Some(app.metadata.generation.unwrap_or(1));
        app.metadata.uid = Some(format!("uid-{}", app.name_any()));
        state.apps.insert(key_of(&app), app.clone());
        app
    }

    /// Edit a stored app outside the controller (a user or another writer)
    pub fn edit_app(&self, name: &str, namespace: &str, f: impl FnOnce(&mut AtlasApp)) {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let app = state.apps.get_mut(&key(name, namespace)).unwrap();
        f(app);
        app.metadata.resource_version = Some(rv);
    }

    /// Current copy of an app
    pub fn app(&self, name: &str, namespace: &str) -> Option<AtlasApp> {
        self.state.lock().unwrap().apps.get(&key(name, namespace)).cloned()
    }

    /// Current copy of a deployment
    pub fn deployment(&self, name: &str, namespace: &str) -> Option<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(name, namespace))
            .cloned()
    }

    /// Current copy of a service
    pub fn service(&self, name: &str, namespace: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&key(name, namespace))
            .cloned()
    }

    /// Delete an app as the API server would: an app holding finalizers only
    /// gets a deletion timestamp, anything else is gone at once
    pub fn delete_app(&self, name: &str, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        let k = key(name, namespace);
        let rv = state.bump();
        let Some(app) = state.apps.get_mut(&k) else {
            return;
        };
        if app.finalizers().is_empty() {
            state.apps.remove(&k);
            return;
        }
        app.metadata.deletion_timestamp = Some(
            serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z"))
                .expect("valid timestamp"),
        );
        app.metadata.resource_version = Some(rv);
    }

    /// Report replica counts on a deployment, as the deployment controller
    /// would once it has rolled out the current template
    pub fn set_deployment_replicas(&self, name: &str, namespace: &str, ready: i32, total: i32) {
        self.edit_deployment(name, namespace, |d| {
            d.status = Some(DeploymentStatus {
                observed_generation: d.metadata.generation,
                replicas: Some(total),
                updated_replicas: Some(total),
                ready_replicas: Some(ready),
                ..Default::default()
            });
        });
    }

    /// Edit a stored deployment outside the controller
    pub fn edit_deployment(&self, name: &str, namespace: &str, f: impl FnOnce(&mut Deployment)) {
        let mut state = self.state.lock().unwrap();
        let rv = state.bump();
        let deployment = state.deployments.get_mut(&key(name, namespace)).unwrap();
        f(deployment);
        deployment.metadata.resource_version = Some(rv);
    }

    /// Store a deployment directly, bypassing the write log
    pub fn seed_deployment(&self, mut deployment: Deployment) {
        let mut state = self.state.lock().unwrap();
        deployment.metadata.resource_version = Some(state.bump());
        state.deployments.insert(key_of(&deployment), deployment);
    }

    /// Mutating calls made so far, e.g. `create Deployment dev/web`
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// Make the next `n` status patches fail with a conflict
    pub fn conflict_status_patches(&self, n: u32) {
        self.state.lock().unwrap().status_conflicts = n;
    }

    /// Apply `f` to the stored app right before the next status patch lands,
    /// as a concurrent spec edit would
    pub fn edit_before_next_status_patch(&self, f: impl FnOnce(&mut AtlasApp) + Send + 'static) {
        self.state.lock().unwrap().edit_before_status_patch = Some(Box::new(f));
    }

    /// Make deployment creation fail with a transient error
    pub fn fail_deployment_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_deployment_create = fail;
    }

    /// Make AtlasApp create/replace fail with a transient error
    pub fn fail_app_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_app_writes = fail;
    }

    /// Let another writer win the next deployment create
    pub fn race_deployment_create(&self) {
        self.state.lock().unwrap().race_deployment_create = true;
    }

    /// Make the next deployment replace fail with a conflict
    pub fn conflict_deployment_replace(&self) {
        self.state.lock().unwrap().conflict_deployment_replace = true;
    }
}

fn check_version(kind: &str, k: &Key, stored: Option<&String>, sent: Option<&String>) -> Result<(), Error> {
    match sent {
        Some(sent) if Some(sent) != stored => Err(Error::conflict(
            kind,
            display(k),
            "the object has been modified; please apply your changes to the latest version",
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl AppKubeClient for FakeKube {
    async fn get_app(&self, name: &str, namespace: &str) -> Result<Option<AtlasApp>, Error> {
        Ok(self.app(name, namespace))
    }

    async fn create_app(&self, app: &AtlasApp) -> Result<AtlasApp, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(app);
        if state.fail_app_writes {
            return Err(Error::transient("AtlasApp", display(&k), "connection refused"));
        }
        if state.apps.contains_key(&k) {
            return Err(Error::AlreadyExists {
                kind: "AtlasApp".to_string(),
                name: display(&k),
            });
        }
        let mut stored = app.clone();
        stored.metadata.resource_version = Some(state.bump());
        stored.metadata.generation = Some(1);
        stored.metadata.uid = Some(format!("uid-{}", stored.name_any()));
        state.writes.push(format!("create AtlasApp {}", display(&k)));
        state.apps.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_app(&self, app: &AtlasApp) -> Result<AtlasApp, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(app);
        if state.fail_app_writes {
            return Err(Error::transient("AtlasApp", display(&k), "connection refused"));
        }
        let current = state
            .apps
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found("AtlasApp", display(&k)))?;
        check_version(
            "AtlasApp",
            &k,
            current.metadata.resource_version.as_ref(),
            app.metadata.resource_version.as_ref(),
        )?;
        let mut stored = app.clone();
        stored.status = current.status.clone();
        stored.metadata.resource_version = Some(state.bump());
        let generation = current.metadata.generation.unwrap_or(1);
        stored.metadata.generation = Some(if stored.spec != current.spec {
            generation + 1
        } else {
            generation
        });
        state.writes.push(format!("replace AtlasApp {}", display(&k)));
        state.apps.insert(k, stored.clone());
        Ok(stored)
    }

    async fn patch_app_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &AtlasAppStatus,
    ) -> Result<AtlasApp, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(name, namespace);
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            state.writes.push(format!("conflict AtlasApp/status {}", display(&k)));
            return Err(Error::conflict("AtlasApp", display(&k), "injected conflict"));
        }
        if let Some(edit) = state.edit_before_status_patch.take() {
            let rv = state.bump();
            if let Some(app) = state.apps.get_mut(&k) {
                edit(app);
                app.metadata.resource_version = Some(rv);
                app.metadata.generation = app.metadata.generation.map(|g| g + 1);
            }
        }
        let stored_rv = state
            .apps
            .get(&k)
            .ok_or_else(|| Error::not_found("AtlasApp", display(&k)))?
            .metadata
            .resource_version
            .clone();
        check_version("AtlasApp", &k, stored_rv.as_ref(), resource_version.as_ref())?;
        let rv = state.bump();
        state.writes.push(format!("patch AtlasApp/status {}", display(&k)));
        let app = state
            .apps
            .get_mut(&k)
            .ok_or_else(|| Error::not_found("AtlasApp", display(&k)))?;
        app.status = Some(status.clone());
        app.metadata.resource_version = Some(rv);
        Ok(app.clone())
    }

    async fn add_app_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(name, namespace);
        let rv = state.bump();
        let app = state
            .apps
            .get_mut(&k)
            .ok_or_else(|| Error::not_found("AtlasApp", display(&k)))?;
        let finalizers = app.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        app.metadata.resource_version = Some(rv);
        state.writes.push(format!("patch AtlasApp/finalizers {}", display(&k)));
        Ok(())
    }

    async fn remove_app_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(name, namespace);
        let rv = state.bump();
        let app = state
            .apps
            .get_mut(&k)
            .ok_or_else(|| Error::not_found("AtlasApp", display(&k)))?;
        if let Some(finalizers) = app.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        app.metadata.resource_version = Some(rv);
        let released = app.metadata.deletion_timestamp.is_some() && app.finalizers().is_empty();
        if released {
            state.apps.remove(&k);
        }
        state.writes.push(format!("patch AtlasApp/finalizers {}", display(&k)));
        Ok(())
    }

    async fn get_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.deployment(name, namespace))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(deployment);
        if state.fail_deployment_create {
            return Err(Error::transient(
                "Deployment",
                display(&k),
                "admission webhook unavailable",
            ));
        }
        if state.race_deployment_create {
            state.race_deployment_create = false;
            let mut theirs = deployment.clone();
            theirs.metadata.resource_version = Some(state.bump());
            state.deployments.insert(k.clone(), theirs);
        }
        if state.deployments.contains_key(&k) {
            return Err(Error::AlreadyExists {
                kind: "Deployment".to_string(),
                name: display(&k),
            });
        }
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.bump());
        stored.metadata.generation = Some(1);
        state.writes.push(format!("create Deployment {}", display(&k)));
        state.deployments.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(deployment);
        if state.conflict_deployment_replace {
            state.conflict_deployment_replace = false;
            return Err(Error::conflict("Deployment", display(&k), "injected conflict"));
        }
        let current = state
            .deployments
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::not_found("Deployment", display(&k)))?;
        check_version(
            "Deployment",
            &k,
            current.metadata.resource_version.as_ref(),
            deployment.metadata.resource_version.as_ref(),
        )?;
        let mut stored = deployment.clone();
        stored.status = current.status.clone();
        stored.metadata.resource_version = Some(state.bump());
        let generation = current.metadata.generation.unwrap_or(1);
        stored.metadata.generation = Some(if stored.spec != current.spec {
            generation + 1
        } else {
            generation
        });
        state.writes.push(format!("replace Deployment {}", display(&k)));
        state.deployments.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        Ok(self.service(name, namespace))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(service);
        if state.services.contains_key(&k) {
            return Err(Error::AlreadyExists {
                kind: "Service".to_string(),
                name: display(&k),
            });
        }
        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.writes.push(format!("create Service {}", display(&k)));
        state.services.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key_of(service);
        let current_rv = state
            .services
            .get(&k)
            .ok_or_else(|| Error::not_found("Service", display(&k)))?
            .metadata
            .resource_version
            .clone();
        check_version(
            "Service",
            &k,
            current_rv.as_ref(),
            service.metadata.resource_version.as_ref(),
        )?;
        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.writes.push(format!("replace Service {}", display(&k)));
        state.services.insert(k, stored.clone());
        Ok(stored)
    }
}

/// Event publisher that keeps the reasons it was given
#[derive(Default)]
pub struct RecordingEvents {
    reasons: Mutex<Vec<String>>,
}

impl RecordingEvents {
    /// Reasons published so far, oldest first
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

/// Catalog that keeps the calls it received, e.g. `upsert web-dev`
#[derive(Default)]
pub struct RecordingCatalog {
    calls: Mutex<Vec<String>>,
    last_properties: Mutex<Option<EntityProperties>>,
}

impl RecordingCatalog {
    /// Calls received so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Properties of the most recent upsert
    pub fn last_properties(&self) -> Option<EntityProperties> {
        self.last_properties.lock().unwrap().clone()
    }

    /// Wait for spawned catalog calls to land
    pub async fn wait_for_calls(&self, n: usize) -> Vec<String> {
        for _ in 0..100 {
            if self.calls.lock().unwrap().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.calls()
    }
}

#[async_trait]
impl CatalogSync for RecordingCatalog {
    async fn upsert(&self, entity_id: &str, properties: &EntityProperties) -> Result<(), Error> {
        self.calls.lock().unwrap().push(format!("upsert {entity_id}"));
        *self.last_properties.lock().unwrap() = Some(properties.clone());
        Ok(())
    }

    async fn delete(&self, entity_id: &str) -> Result<(), Error> {
        self.calls.lock().unwrap().push(format!("delete {entity_id}"));
        Ok(())
    }
}
