//! Custom Resource Definitions for wakevirt
//!
//! A single cluster-scoped kind, `WolConfig`, declares which VMs are
//! eligible for Wake-on-LAN and how the agent fleet is shaped.

mod config;
mod types;

pub use config::{WolConfig, WolConfigSpec, MAX_WOL_PORTS};
pub use types::{
    AgentSpec, AgentStatus, Condition, ConditionStatus, DiscoveryMode, MacVmMapping,
    WolConfigStatus,
};
