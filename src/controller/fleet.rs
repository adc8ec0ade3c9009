//! Agent fleet reconciliation
//!
//! Every WolConfig owns one DaemonSet named `wol-agent-<config-name>` that
//! runs the capture agent on each eligible node. The pod spec is derived
//! from `spec.agent` with defaults suitable for host-network packet capture.
//! Ownership is a controller owner reference, so deleting the WolConfig
//! cascades to the fleet.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecurityContext,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::crd::{WolConfig, WolConfigSpec};
use crate::Error;

/// Label identifying agent DaemonSets managed by this operator.
pub const AGENT_APP_LABEL: &str = "wol-agent";
/// Label carrying the owning WolConfig's name.
pub const WOLCONFIG_LABEL: &str = "wol.wakevirt.dev/wolconfig";
/// ServiceAccount the agent pods run as (created by the install manifests).
pub const AGENT_SERVICE_ACCOUNT: &str = "wakevirt-wol-agent";

/// Deployment-level knobs for agent fleets, fixed at operator startup.
#[derive(Clone, Debug)]
pub struct FleetParams {
    /// Agent container image used when the WolConfig has no override.
    pub agent_image: String,
    /// gRPC address agents report events to.
    pub operator_address: String,
    /// Namespace the fleets are created in (the operator's namespace).
    pub namespace: String,
}

/// Name of the DaemonSet owned by the given WolConfig.
pub fn fleet_name(config: &WolConfig) -> String {
    format!("wol-agent-{}", config.name_any())
}

/// Minimal view of DaemonSet state used by the WolConfig status.
pub type FleetCounts = (i32, i32, i32);

/// Create/read/update access to agent DaemonSets.
///
/// Narrow by design: the controller logic is tested against a mock while
/// [`KubeFleetStore`] talks to the real API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Fetches a DaemonSet, or None if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, Error>;
    /// Creates a new DaemonSet.
    async fn create(&self, fleet: &DaemonSet) -> Result<(), Error>;
    /// Replaces an existing DaemonSet.
    async fn update(&self, fleet: &DaemonSet) -> Result<(), Error>;
    /// Lists the agent DaemonSets managed by this operator.
    async fn list_managed(&self, namespace: &str) -> Result<Vec<DaemonSet>, Error>;
}

/// [`FleetStore`] backed by the Kubernetes API.
pub struct KubeFleetStore {
    client: Client,
}

impl KubeFleetStore {
    /// Creates a store using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl FleetStore for KubeFleetStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, fleet: &DaemonSet) -> Result<(), Error> {
        let namespace = fleet.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), fleet)
            .await?;
        Ok(())
    }

    async fn update(&self, fleet: &DaemonSet) -> Result<(), Error> {
        let namespace = fleet.namespace().unwrap_or_default();
        self.api(&namespace)
            .replace(&fleet.name_any(), &PostParams::default(), fleet)
            .await?;
        Ok(())
    }

    async fn list_managed(&self, namespace: &str) -> Result<Vec<DaemonSet>, Error> {
        let params = ListParams::default().labels(&format!("app={AGENT_APP_LABEL}"));
        Ok(self.api(namespace).list(&params).await?.items)
    }
}

/// Creates or updates the agent DaemonSet for the given config.
pub async fn reconcile_fleet(
    config: &WolConfig,
    spec: &WolConfigSpec,
    params: &FleetParams,
    store: &dyn FleetStore,
) -> Result<(), Error> {
    let desired = build_fleet(config, spec, params);
    let name = fleet_name(config);

    match store.get(&params.namespace, &name).await? {
        None => {
            info!(fleet = %name, config = %config.name_any(), "creating agent DaemonSet");
            store.create(&desired).await
        }
        Some(mut existing) => {
            info!(fleet = %name, config = %config.name_any(), "updating agent DaemonSet");
            existing.spec = desired.spec.clone();
            existing.metadata.labels = desired.metadata.labels.clone();
            store.update(&existing).await
        }
    }
}

/// Reads the observed pod counts of a config's fleet, or None if the
/// DaemonSet does not exist yet.
pub async fn fleet_counts(
    config: &WolConfig,
    namespace: &str,
    store: &dyn FleetStore,
) -> Result<Option<FleetCounts>, Error> {
    let name = fleet_name(config);
    Ok(store.get(namespace, &name).await?.map(|fleet| {
        let status = fleet.status.unwrap_or_default();
        (
            status.desired_number_scheduled,
            status.number_ready,
            status.number_available.unwrap_or(0),
        )
    }))
}

fn fleet_labels(config: &WolConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), AGENT_APP_LABEL.to_string()),
        (
            "app.kubernetes.io/name".to_string(),
            AGENT_APP_LABEL.to_string(),
        ),
        ("app.kubernetes.io/component".to_string(), "agent".to_string()),
        ("app.kubernetes.io/part-of".to_string(), "wakevirt".to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "wakevirt-operator".to_string(),
        ),
        (WOLCONFIG_LABEL.to_string(), config.name_any()),
    ])
}

fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("50m".to_string())),
            ("memory".to_string(), Quantity("64Mi".to_string())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("100m".to_string())),
            ("memory".to_string(), Quantity("128Mi".to_string())),
        ])),
        ..Default::default()
    }
}

fn default_tolerations() -> Vec<Toleration> {
    vec![
        Toleration {
            effect: Some("NoSchedule".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        },
        Toleration {
            effect: Some("NoExecute".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        },
    ]
}

/// Builds the desired DaemonSet for a config. Deterministic: the same
/// config always yields an identical object, so repeated reconciles cause
/// no spurious updates.
pub fn build_fleet(config: &WolConfig, spec: &WolConfigSpec, params: &FleetParams) -> DaemonSet {
    let labels = fleet_labels(config);
    let agent = &spec.agent;

    let image = agent
        .image
        .clone()
        .filter(|image| !image.is_empty())
        .unwrap_or_else(|| params.agent_image.clone());
    let image_pull_policy = agent
        .image_pull_policy
        .clone()
        .filter(|policy| !policy.is_empty())
        .unwrap_or_else(|| "Always".to_string());

    let ports_csv = spec
        .wol_ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let resources = agent
        .resources
        .clone()
        .filter(|r| r.requests.is_some() || r.limits.is_some())
        .unwrap_or_else(default_resources);

    let container = Container {
        name: "agent".to_string(),
        image: Some(image),
        image_pull_policy: Some(image_pull_policy),
        args: Some(vec![
            "agent".to_string(),
            "--node-name=$(NODE_NAME)".to_string(),
            format!("--operator-address={}", params.operator_address),
            format!("--ports={ports_csv}"),
        ]),
        env: Some(vec![
            EnvVar {
                name: "NODE_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "WOLCONFIG_NAME".to_string(),
                value: Some(config.name_any()),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_BIND_SERVICE".to_string()]),
                drop: Some(vec!["ALL".to_string()]),
            }),
            ..Default::default()
        }),
        resources: Some(resources),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(crate::DEFAULT_HEALTH_PORT as i32),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            period_seconds: Some(30),
            timeout_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/readyz".to_string()),
                port: IntOrString::Int(crate::DEFAULT_HEALTH_PORT as i32),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            timeout_seconds: Some(3),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        // Packets arrive on node interfaces, so agents share the host
        // network namespace.
        host_network: Some(true),
        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
        service_account_name: Some(AGENT_SERVICE_ACCOUNT.to_string()),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        }),
        containers: vec![container],
        node_selector: agent.node_selector.clone().filter(|s| !s.is_empty()),
        tolerations: Some(
            agent
                .tolerations
                .clone()
                .filter(|tolerations| !tolerations.is_empty())
                .unwrap_or_else(default_tolerations),
        ),
        priority_class_name: agent
            .priority_class_name
            .clone()
            .filter(|name| !name.is_empty()),
        ..Default::default()
    };

    let update_strategy = agent
        .update_strategy
        .clone()
        .unwrap_or_else(|| DaemonSetUpdateStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateDaemonSet {
                max_unavailable: Some(IntOrString::Int(1)),
                ..Default::default()
            }),
        });

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(fleet_name(config)),
            namespace: Some(params.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: config.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            update_strategy: Some(update_strategy),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}
