//! AtlasApp controller
//!
//! [`reconcile`] and [`error_policy`] implement the observe-diff-act loop for
//! one AtlasApp; [`run_controller`] wires them to the watch streams. The
//! pure decision steps live in their own modules so they can be tested
//! without an API server.

mod application;
pub mod approval;
mod client;
pub mod promotion;
mod runner;
pub mod status;
pub mod sync;
#[cfg(test)]
pub(crate) mod testing;

pub use application::{error_policy, reconcile, Context};
pub use client::{AppKubeClient, AppKubeClientImpl};
pub use runner::{run_controller, WATCH_TIMEOUT_SECS};
