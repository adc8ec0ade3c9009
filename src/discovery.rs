//! VirtualMachine discovery
//!
//! The controller needs to list VMs (optionally per namespace, optionally
//! filtered by label selector) and read the MAC addresses declared on their
//! interfaces. That is the whole contract with the virtualization API at
//! discovery time, so it lives behind the narrow [`VmLister`] trait and the
//! controller tests run against an in-memory fake.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::ApiResource;
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::mapper::normalize_mac;
use crate::Error;

/// The KubeVirt VirtualMachine API resource, accessed untyped.
pub fn virtual_machine_resource() -> ApiResource {
    ApiResource {
        group: "kubevirt.io".to_string(),
        version: "v1".to_string(),
        api_version: "kubevirt.io/v1".to_string(),
        kind: "VirtualMachine".to_string(),
        plural: "virtualmachines".to_string(),
    }
}

/// A VirtualMachine found during discovery, with its declared MACs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredVm {
    /// VM name
    pub name: String,
    /// VM namespace
    pub namespace: String,
    /// Canonical (lowercase) MAC addresses of the VM's interfaces
    pub mac_addresses: Vec<String>,
}

/// Lists VirtualMachines for mapping discovery.
#[async_trait]
pub trait VmLister: Send + Sync {
    /// Lists VMs in the given namespace (all namespaces when `None`),
    /// optionally restricted by a label selector.
    async fn list_vms(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<DiscoveredVm>, Error>;
}

/// [`VmLister`] implementation backed by the KubeVirt API.
pub struct KubeVirtLister {
    client: Client,
}

impl KubeVirtLister {
    /// Creates a lister using the given Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VmLister for KubeVirtLister {
    async fn list_vms(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<DiscoveredVm>, Error> {
        let resource = virtual_machine_resource();
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };

        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(&selector_string(selector)?);
        }

        let vms = api.list(&params).await?;
        let discovered: Vec<_> = vms.items.iter().map(extract_vm).collect();
        debug!(
            namespace = namespace.unwrap_or("<all>"),
            count = discovered.len(),
            "listed VirtualMachines"
        );
        Ok(discovered)
    }
}

/// Pulls name, namespace, and interface MACs out of a VirtualMachine object.
pub fn extract_vm(vm: &DynamicObject) -> DiscoveredVm {
    let mac_addresses = vm
        .data
        .pointer("/spec/template/spec/domain/devices/interfaces")
        .and_then(|v| v.as_array())
        .map(|interfaces| {
            interfaces
                .iter()
                .filter_map(|iface| iface.get("macAddress").and_then(|m| m.as_str()))
                .filter(|mac| !mac.is_empty())
                .map(normalize_mac)
                .collect()
        })
        .unwrap_or_default();

    DiscoveredVm {
        name: vm.name_any(),
        namespace: vm.namespace().unwrap_or_default(),
        mac_addresses,
    }
}

/// Renders a `LabelSelector` into the string form the list API expects.
///
/// Supports `matchLabels` plus the four `matchExpressions` operators.
pub fn selector_string(selector: &LabelSelector) -> Result<String, Error> {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            parts.push(format!("{key}={value}"));
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default();
            match expr.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expr.key, values.join(","))),
                "NotIn" => parts.push(format!("{} notin ({})", expr.key, values.join(","))),
                "Exists" => parts.push(expr.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                other => {
                    return Err(Error::validation(format!(
                        "unsupported label selector operator: {other}"
                    )))
                }
            }
        }
    }

    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use std::collections::BTreeMap;

    fn vm_object(name: &str, namespace: &str, data: serde_json::Value) -> DynamicObject {
        let mut vm = DynamicObject::new(name, &virtual_machine_resource());
        vm.metadata.namespace = Some(namespace.to_string());
        vm.data = data;
        vm
    }

    #[test]
    fn extracts_interface_macs() {
        let vm = vm_object(
            "test-vm",
            "default",
            serde_json::json!({
                "spec": { "template": { "spec": { "domain": { "devices": {
                    "interfaces": [
                        { "name": "default", "macAddress": "52:54:00:12:34:56" },
                        { "name": "secondary", "macAddress": "02:F1:EF:00:00:0B" }
                    ]
                } } } } }
            }),
        );

        let discovered = extract_vm(&vm);
        assert_eq!(discovered.name, "test-vm");
        assert_eq!(discovered.namespace, "default");
        // MACs come out normalized
        assert_eq!(
            discovered.mac_addresses,
            vec!["52:54:00:12:34:56", "02:f1:ef:00:00:0b"]
        );
    }

    #[test]
    fn skips_interfaces_without_mac() {
        let vm = vm_object(
            "test-vm",
            "default",
            serde_json::json!({
                "spec": { "template": { "spec": { "domain": { "devices": {
                    "interfaces": [
                        { "name": "default" },
                        { "name": "empty", "macAddress": "" },
                        { "name": "real", "macAddress": "52:54:00:00:00:01" }
                    ]
                } } } } }
            }),
        );

        assert_eq!(extract_vm(&vm).mac_addresses, vec!["52:54:00:00:00:01"]);
    }

    #[test]
    fn tolerates_vm_without_template() {
        let vm = vm_object("bare-vm", "default", serde_json::json!({ "spec": {} }));
        assert!(extract_vm(&vm).mac_addresses.is_empty());
    }

    #[test]
    fn renders_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "wol.enabled".to_string(),
                "true".to_string(),
            )])),
            match_expressions: None,
        };
        assert_eq!(selector_string(&selector).unwrap(), "wol.enabled=true");
    }

    #[test]
    fn renders_match_expressions() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["db".to_string(), "cache".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "wol".to_string(),
                    operator: "Exists".to_string(),
                    values: None,
                },
                LabelSelectorRequirement {
                    key: "ephemeral".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };
        assert_eq!(
            selector_string(&selector).unwrap(),
            "tier in (db,cache),wol,!ephemeral"
        );
    }

    #[test]
    fn rejects_unknown_operator() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "x".to_string(),
                operator: "GreaterThan".to_string(),
                values: None,
            }]),
        };
        assert!(selector_string(&selector).is_err());
    }

    #[test]
    fn empty_selector_renders_empty_string() {
        let selector = LabelSelector::default();
        assert_eq!(selector_string(&selector).unwrap(), "");
    }
}
