//! Desired child resources for an AtlasApp
//!
//! [`build_desired_state`] is a pure function of the AtlasApp and the
//! controller's [`WorkloadTemplate`]: the same input always yields the same
//! Deployment and Service, down to label ordering. The synchronizer compares
//! these against what the API server holds.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::AtlasApp;
use crate::CONTROLLER_NAME;

/// Name of the application container in the pod template
pub const APP_CONTAINER: &str = "app";

/// Env var carrying the migration id
pub const MIGRATION_ID_ENV: &str = "MIGRATION_ID";

/// Env var carrying the environment name
pub const ENVIRONMENT_ENV: &str = "ENVIRONMENT";

/// Label selecting the application's pods
pub const APP_LABEL: &str = "app";

/// Label recording the environment
pub const ENVIRONMENT_LABEL: &str = "atlas.io/environment";

/// Label recording the deployed version
pub const VERSION_LABEL: &str = "atlas.io/version";

/// Label marking objects owned by this controller
pub const MANAGED_BY_LABEL: &str = "atlas.io/managed-by";

/// Controller-wide inputs to child construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadTemplate {
    /// Image repository; the tag is the app version
    pub image_repository: String,
    /// Port the container listens on and the Service exposes
    pub container_port: i32,
}

impl Default for WorkloadTemplate {
    fn default() -> Self {
        Self {
            image_repository: "nginx".to_string(),
            container_port: 80,
        }
    }
}

impl WorkloadTemplate {
    /// Image reference for a given version
    pub fn image(&self, version: &str) -> String {
        format!("{}:{}", self.image_repository, version)
    }
}

/// The children an AtlasApp should have
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    /// The workload
    pub deployment: Deployment,
    /// The network endpoint
    pub service: Service,
}

/// Build the desired Deployment and Service for an AtlasApp
pub fn build_desired_state(app: &AtlasApp, template: &WorkloadTemplate) -> DesiredState {
    DesiredState {
        deployment: build_deployment(app, template),
        service: build_service(app, template),
    }
}

fn labels(app: &AtlasApp) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.name_any()),
        (ENVIRONMENT_LABEL.to_string(), app.spec.environment.clone()),
        (VERSION_LABEL.to_string(), app.spec.version.clone()),
        (MANAGED_BY_LABEL.to_string(), CONTROLLER_NAME.to_string()),
    ])
}

fn selector(app: &AtlasApp) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), app.name_any())])
}

fn metadata(app: &AtlasApp) -> ObjectMeta {
    ObjectMeta {
        name: Some(app.name_any()),
        namespace: app.namespace(),
        labels: Some(labels(app)),
        owner_references: app.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

fn http_probe(port: i32, initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        ..Default::default()
    }
}

fn build_deployment(app: &AtlasApp, template: &WorkloadTemplate) -> Deployment {
    let port = template.container_port;

    let container = Container {
        name: APP_CONTAINER.to_string(),
        image: Some(template.image(&app.spec.version)),
        ports: Some(vec![ContainerPort {
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            EnvVar {
                name: MIGRATION_ID_ENV.to_string(),
                value: Some(app.spec.migration_id.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: ENVIRONMENT_ENV.to_string(),
                value: Some(app.spec.environment.clone()),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(http_probe(port, 30, 10)),
        readiness_probe: Some(http_probe(port, 5, 5)),
        ..Default::default()
    };

    Deployment {
        metadata: metadata(app),
        spec: Some(DeploymentSpec {
            replicas: Some(app.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector(app)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(app)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(app: &AtlasApp, template: &WorkloadTemplate) -> Service {
    Service {
        metadata: metadata(app),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector(app)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: template.container_port,
                target_port: Some(IntOrString::Int(template.container_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Owned-field accessors
// =============================================================================

/// The application container of a Deployment, if present
pub fn app_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == APP_CONTAINER)
}

/// Value of an env var on a container
pub fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

/// First container port of a container
pub fn container_port(container: &Container) -> Option<i32> {
    container
        .ports
        .as_ref()?
        .first()
        .map(|p| p.container_port)
}
