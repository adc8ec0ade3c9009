//! Controller implementations for the WolConfig resource
//!
//! Reconciliation follows the usual observe-diff-act loop: validate the
//! spec, keep the agent fleet in shape, rebuild the global MAC mapping, and
//! write the outcome back to status.

mod config;
mod fleet;
mod startup;

pub use config::{
    error_policy, rebuild_mapping, reconcile, run, ConfigStore, Context, KubeConfigStore,
    CONDITION_READY, IMAGE_CHECK_ANNOTATION, REASON_AGENT_FAILED, REASON_INVALID_CONFIG,
    REASON_MAPPING_UPDATED,
};
pub use fleet::{
    build_fleet, fleet_name, reconcile_fleet, FleetParams, FleetStore, KubeFleetStore,
    AGENT_APP_LABEL, AGENT_SERVICE_ACCOUNT, WOLCONFIG_LABEL,
};
pub use startup::{detect_image_drift, spawn as spawn_startup_drift_detection};
