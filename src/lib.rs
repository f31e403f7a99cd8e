//! Atlas - Kubernetes controller for application deployment and promotion
//!
//! Atlas reconciles `AtlasApp` resources into a Deployment and a Service,
//! derives the application's status from what it observes, and promotes the
//! application definition along a fixed environment chain (dev → stage → prod).
//!
//! # Architecture
//!
//! Every reconcile is level-triggered:
//! - The latest `AtlasApp` is fetched and passed through the approval gate
//! - Desired children are built from the spec and synchronized idempotently
//! - Status is projected from observed children, never from stored history
//! - Ready applications with auto-promotion replicate into the next environment
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definition (AtlasApp) and the promotion chain
//! - [`controller`] - Reconciliation logic (gate, sync, status, promotion)
//! - [`workload`] - Desired Deployment/Service construction
//! - [`health`] - HTTP health probing of the exposed endpoint
//! - [`catalog`] - Best-effort catalog synchronization
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Optimistic-concurrency and backoff retry combinators
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod catalog;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod health;
pub mod retry;
pub mod telemetry;
pub mod workload;

pub use error::Error;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager / reporting component name used for API writes and Events
pub const CONTROLLER_NAME: &str = "atlas-controller";

/// Annotation a human sets to grant a prod rollout of a specific version
pub const APPROVED_VERSION_ANNOTATION: &str = "atlas.io/approved-version";

/// Annotation a human sets on the source application to authorize promotion
/// of a specific version into prod
pub const PROMOTION_APPROVED_ANNOTATION: &str = "atlas.io/promotion-approved-version";

/// Finalizer holding an AtlasApp until its catalog entity is removed
pub const CATALOG_FINALIZER: &str = "atlas.io/catalog";
