//! Supporting types for the WolConfig CRD

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::DaemonSetUpdateStrategy;
use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How VMs are discovered for WoL management
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Watch all VMs in the selected namespaces
    #[default]
    All,
    /// Watch VMs matching the label selector
    LabelSelector,
    /// Use explicit MAC to VM mappings
    Explicit,
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::LabelSelector => write!(f, "LabelSelector"),
            Self::Explicit => write!(f, "Explicit"),
        }
    }
}

/// An explicit MAC address to VM mapping
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MacVmMapping {
    /// MAC address in `xx:xx:xx:xx:xx:xx` format
    #[schemars(regex(pattern = r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$"))]
    pub mac_address: String,
    /// Name of the VirtualMachine
    pub vm_name: String,
    /// Namespace where the VM resides
    pub namespace: String,
}

/// Pod shape for the per-config agent DaemonSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Node selector the agent pods must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Tolerations for the agent pods (defaults to tolerating all
    /// NoSchedule and NoExecute taints)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Compute resources for the agent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Container image override (defaults to the operator's agent image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy for the agent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// DaemonSet update strategy (defaults to rolling, max-unavailable 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<DaemonSetUpdateStrategy>,

    /// Priority class for the agent pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// Observed state of a WolConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WolConfigStatus {
    /// Number of VMs currently being monitored
    #[serde(default, rename = "managedVMs")]
    pub managed_vms: i32,

    /// Timestamp of the last VM mapping update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,

    /// Latest observations of the WolConfig state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Status of the managed agent DaemonSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_status: Option<AgentStatus>,
}

impl WolConfigStatus {
    /// Replaces the condition of the same type, keeping a single entry per
    /// condition type.
    pub fn set_condition(&mut self, condition: Condition) {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    /// The condition of the given type, if present.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Status of the agent DaemonSet owned by a WolConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Name of the managed DaemonSet
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub daemon_set_name: String,
    /// Number of nodes that should run an agent pod
    #[serde(default)]
    pub desired_number_scheduled: i32,
    /// Number of nodes with a ready agent pod
    #[serde(default)]
    pub number_ready: i32,
    /// Number of nodes with an available agent pod
    #[serde(default)]
    pub number_available: i32,
}

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The condition state is not known
    #[default]
    Unknown,
}

/// A single observation of the resource state
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. `Ready`)
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds
    pub status: ConditionStatus,
    /// Machine-readable reason for the last transition
    pub reason: String,
    /// Human-readable detail
    pub message: String,
    /// When the condition last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Generation of the spec this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Creates a condition stamped with the current time.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
            observed_generation: None,
        }
    }

    /// Attaches the observed generation.
    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}
