//! Custom Resource Definitions for Atlas
//!
//! This module contains the AtlasApp CRD and the promotion chain it moves along.

mod application;
mod types;

pub use application::{AtlasApp, AtlasAppSpec, AtlasAppStatus, MAX_CONDITIONS};
pub use types::{
    next_environment, AppPhase, Condition, ConditionStatus, Environment, PROMOTION_CHAIN,
};
