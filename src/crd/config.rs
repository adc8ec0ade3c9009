//! WolConfig Custom Resource Definition
//!
//! A cluster-scoped, declarative description of which VirtualMachines are
//! eligible for Wake-on-LAN and how the per-node agent fleet is deployed.
//! Multiple WolConfigs compose in OR: the effective mapping is the union of
//! all configs in the cluster.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AgentSpec, DiscoveryMode, MacVmMapping, WolConfigStatus};
use crate::{DEFAULT_CACHE_TTL_SECS, DEFAULT_WOL_PORT};

/// Maximum number of WoL ports one config may bind per node.
pub const MAX_WOL_PORTS: usize = 10;

/// Specification for a WolConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "wol.wakevirt.dev",
    version = "v1beta1",
    kind = "WolConfig",
    plural = "wolconfigs",
    shortname = "wolcfg",
    status = "WolConfigStatus",
    printcolumn = r#"{"name":"Discovery Mode","type":"string","jsonPath":".spec.discoveryMode"}"#,
    printcolumn = r#"{"name":"WOL Port","type":"integer","jsonPath":".spec.wolPorts[0]"}"#,
    printcolumn = r#"{"name":"Managed VMs","type":"integer","jsonPath":".status.managedVMs"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WolConfigSpec {
    /// How VMs are discovered for this config
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,

    /// Namespaces to watch for VMs; empty means all namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_selectors: Vec<String>,

    /// Label selector for VMs (required with `LabelSelector` mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_selector: Option<LabelSelector>,

    /// Explicit MAC to VM mappings (required with `Explicit` mode)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub explicit_mappings: Vec<MacVmMapping>,

    /// UDP ports the agents listen on for magic packets; defaults to `[9]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wol_ports: Vec<i32>,

    /// Mapping refresh period in seconds; 0 means the default of 300
    #[serde(default, rename = "cacheTTL")]
    pub cache_ttl: i32,

    /// Pod shape for this config's agent DaemonSet
    #[serde(default)]
    pub agent: AgentSpec,
}

impl WolConfigSpec {
    /// Returns the spec with defaults applied, validating as it goes.
    ///
    /// Idempotent: applying it to an already-defaulted spec is a no-op.
    /// Validation failures are terminal for the reconcile (the user has to
    /// change the spec), so callers surface them on the Ready condition and
    /// do not requeue.
    pub fn effective(&self) -> Result<Self, crate::Error> {
        let mut spec = self.clone();

        if spec.wol_ports.is_empty() {
            spec.wol_ports = vec![DEFAULT_WOL_PORT as i32];
        }
        if spec.wol_ports.len() > MAX_WOL_PORTS {
            return Err(crate::Error::validation(format!(
                "too many WoL ports: {} (at most {MAX_WOL_PORTS})",
                spec.wol_ports.len()
            )));
        }
        for &port in &spec.wol_ports {
            if !(1..=65535).contains(&port) {
                return Err(crate::Error::validation(format!(
                    "invalid WoL port: {port} (must be 1-65535)"
                )));
            }
        }

        if spec.cache_ttl < 0 {
            return Err(crate::Error::validation(format!(
                "invalid cache TTL: {} (must be >= 0)",
                spec.cache_ttl
            )));
        }
        if spec.cache_ttl == 0 {
            spec.cache_ttl = DEFAULT_CACHE_TTL_SECS;
        }

        match spec.discovery_mode {
            DiscoveryMode::LabelSelector if spec.vm_selector.is_none() => {
                return Err(crate::Error::validation(
                    "vmSelector is required for LabelSelector discovery mode",
                ));
            }
            DiscoveryMode::Explicit if spec.explicit_mappings.is_empty() => {
                return Err(crate::Error::validation(
                    "explicitMappings is required for Explicit discovery mode",
                ));
            }
            _ => {}
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;
    use crate::crd::Condition;
    use kube::core::CustomResourceExt;

    fn explicit_mapping() -> MacVmMapping {
        MacVmMapping {
            mac_address: "02:F1:EF:00:00:0B".to_string(),
            vm_name: "db-primary".to_string(),
            namespace: "production".to_string(),
        }
    }

    // =========================================================================
    // Defaulting
    // =========================================================================

    /// Story: an empty spec defaults to mode All, port 9, TTL 300
    #[test]
    fn empty_spec_gets_full_defaults() {
        let spec = WolConfigSpec::default();
        let effective = spec.effective().unwrap();

        assert_eq!(effective.discovery_mode, DiscoveryMode::All);
        assert_eq!(effective.wol_ports, vec![9]);
        assert_eq!(effective.cache_ttl, 300);
    }

    /// Story: defaulting is idempotent
    ///
    /// Applying defaults to an already-defaulted spec changes nothing, so
    /// repeated reconciles never see spurious drift.
    #[test]
    fn defaulting_is_idempotent() {
        let effective = WolConfigSpec::default().effective().unwrap();
        let again = effective.effective().unwrap();
        assert_eq!(effective, again);
    }

    #[test]
    fn explicit_values_are_preserved() {
        let spec = WolConfigSpec {
            wol_ports: vec![7, 9],
            cache_ttl: 60,
            namespace_selectors: vec!["default".to_string()],
            ..Default::default()
        };
        let effective = spec.effective().unwrap();
        assert_eq!(effective.wol_ports, vec![7, 9]);
        assert_eq!(effective.cache_ttl, 60);
        assert_eq!(effective.namespace_selectors, vec!["default"]);
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn rejects_out_of_range_ports() {
        for port in [0, -9, 65536, 100_000] {
            let spec = WolConfigSpec {
                wol_ports: vec![port],
                ..Default::default()
            };
            let err = spec.effective().unwrap_err();
            assert!(
                err.to_string().contains("must be 1-65535"),
                "port {port}: {err}"
            );
        }
    }

    #[test]
    fn rejects_more_than_ten_ports() {
        let spec = WolConfigSpec {
            wol_ports: (1..=11).collect(),
            ..Default::default()
        };
        assert!(spec.effective().is_err());
    }

    #[test]
    fn rejects_negative_cache_ttl() {
        let spec = WolConfigSpec {
            cache_ttl: -1,
            ..Default::default()
        };
        let err = spec.effective().unwrap_err();
        assert!(err.to_string().contains("cache TTL"));
    }

    #[test]
    fn label_selector_mode_requires_a_selector() {
        let spec = WolConfigSpec {
            discovery_mode: DiscoveryMode::LabelSelector,
            ..Default::default()
        };
        let err = spec.effective().unwrap_err();
        assert!(err.to_string().contains("vmSelector"));

        let spec = WolConfigSpec {
            discovery_mode: DiscoveryMode::LabelSelector,
            vm_selector: Some(LabelSelector::default()),
            ..Default::default()
        };
        assert!(spec.effective().is_ok());
    }

    #[test]
    fn explicit_mode_requires_mappings() {
        let spec = WolConfigSpec {
            discovery_mode: DiscoveryMode::Explicit,
            ..Default::default()
        };
        let err = spec.effective().unwrap_err();
        assert!(err.to_string().contains("explicitMappings"));

        let spec = WolConfigSpec {
            discovery_mode: DiscoveryMode::Explicit,
            explicit_mappings: vec![explicit_mapping()],
            ..Default::default()
        };
        assert!(spec.effective().is_ok());
    }

    // =========================================================================
    // CRD shape
    // =========================================================================

    #[test]
    fn crd_is_cluster_scoped_with_status_subresource() {
        let crd = WolConfig::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "WolConfig");
        assert_eq!(crd.spec.names.plural, "wolconfigs");
        assert_eq!(
            crd.spec.names.short_names.as_deref(),
            Some(&["wolcfg".to_string()][..])
        );

        let version = &crd.spec.versions[0];
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());

        let columns = version.additional_printer_columns.as_ref().unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Discovery Mode", "WOL Port", "Managed VMs", "Age"]
        );
    }

    #[test]
    fn spec_fields_serialize_with_expected_names() {
        let spec = WolConfigSpec {
            discovery_mode: DiscoveryMode::Explicit,
            explicit_mappings: vec![explicit_mapping()],
            wol_ports: vec![9],
            cache_ttl: 300,
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["discoveryMode"], "Explicit");
        assert_eq!(json["cacheTTL"], 300);
        assert_eq!(json["wolPorts"][0], 9);
        assert_eq!(json["explicitMappings"][0]["macAddress"], "02:F1:EF:00:00:0B");
        assert_eq!(json["explicitMappings"][0]["vmName"], "db-primary");
    }

    #[test]
    fn status_round_trips_through_json() {
        let mut status = WolConfigStatus {
            managed_vms: 2,
            ..Default::default()
        };
        status.set_condition(Condition::new(
            "Ready",
            ConditionStatus::True,
            "MappingUpdated",
            "VM mapping refreshed successfully",
        ));

        let json = serde_json::to_string(&status).unwrap();
        let back: WolConfigStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
