//! WolConfig reconciliation
//!
//! The controller validates each WolConfig, keeps its agent fleet in shape,
//! and rebuilds the global MAC mapping from **all** WolConfigs in the
//! cluster (OR semantics: a MAC is mapped if any config binds it). The
//! rebuilt table is installed atomically into the aggregator's mapper.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    AgentStatus, Condition, ConditionStatus, DiscoveryMode, WolConfig, WolConfigStatus,
};
use crate::discovery::{virtual_machine_resource, VmLister};
use crate::mapper::{normalize_mac, MacMapper, VmBinding};
use crate::metrics::WolMetrics;
use crate::Error;

use super::fleet::{fleet_counts, fleet_name, reconcile_fleet, FleetParams, FleetStore};

/// Condition type carrying the reconcile outcome.
pub const CONDITION_READY: &str = "Ready";
/// Reason: mapping rebuilt and installed.
pub const REASON_MAPPING_UPDATED: &str = "MappingUpdated";
/// Reason: the spec failed validation; no requeue until it changes.
pub const REASON_INVALID_CONFIG: &str = "InvalidConfig";
/// Reason: the agent fleet could not be reconciled.
pub const REASON_AGENT_FAILED: &str = "AgentFailed";

/// Annotation stamped by startup drift detection to provoke a reconcile.
pub const IMAGE_CHECK_ANNOTATION: &str = "wol.wakevirt.dev/last-image-check";

/// Requeue delay after transient failures.
const TRANSIENT_REQUEUE: Duration = Duration::from_secs(30);

/// Read/write access to WolConfig objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Lists every WolConfig in the cluster.
    async fn list(&self) -> Result<Vec<WolConfig>, Error>;
    /// Fetches one WolConfig, or None if absent.
    async fn get(&self, name: &str) -> Result<Option<WolConfig>, Error>;
    /// Patches the status subresource.
    async fn patch_status(&self, name: &str, status: &WolConfigStatus) -> Result<(), Error>;
    /// Merges one annotation onto the object.
    async fn annotate(&self, name: &str, key: &str, value: &str) -> Result<(), Error>;
}

/// [`ConfigStore`] backed by the Kubernetes API.
pub struct KubeConfigStore {
    api: Api<WolConfig>,
}

impl KubeConfigStore {
    /// Creates a store using the given client.
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn list(&self) -> Result<Vec<WolConfig>, Error> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn get(&self, name: &str) -> Result<Option<WolConfig>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn patch_status(&self, name: &str, status: &WolConfigStatus) -> Result<(), Error> {
        let patch = json!({ "status": status });
        self.api
            .patch_status(
                name,
                &PatchParams::apply("wakevirt-operator"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn annotate(&self, name: &str, key: &str, value: &str) -> Result<(), Error> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.api
            .patch(
                name,
                &PatchParams::apply("wakevirt-operator"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls. Every external
/// dependency is a trait object so tests can inject fakes.
pub struct Context {
    /// WolConfig access
    pub configs: Arc<dyn ConfigStore>,
    /// Agent DaemonSet access
    pub fleets: Arc<dyn FleetStore>,
    /// VirtualMachine discovery
    pub vms: Arc<dyn VmLister>,
    /// The mapping table shared with the aggregator
    pub mapper: Arc<MacMapper>,
    /// Operator metrics
    pub metrics: Arc<WolMetrics>,
    /// Fleet deployment knobs
    pub fleet_params: FleetParams,
}

impl Context {
    /// Creates a context over the real Kubernetes API.
    pub fn new(
        client: Client,
        mapper: Arc<MacMapper>,
        metrics: Arc<WolMetrics>,
        fleet_params: FleetParams,
    ) -> Self {
        Self {
            configs: Arc::new(KubeConfigStore::new(client.clone())),
            fleets: Arc::new(super::fleet::KubeFleetStore::new(client.clone())),
            vms: Arc::new(crate::discovery::KubeVirtLister::new(client)),
            mapper,
            metrics,
            fleet_params,
        }
    }

    /// Creates a context with injected stores, for tests.
    pub fn with_stores(
        configs: Arc<dyn ConfigStore>,
        fleets: Arc<dyn FleetStore>,
        vms: Arc<dyn VmLister>,
        mapper: Arc<MacMapper>,
        metrics: Arc<WolMetrics>,
        fleet_params: FleetParams,
    ) -> Self {
        Self {
            configs,
            fleets,
            vms,
            mapper,
            metrics,
            fleet_params,
        }
    }
}

/// Reconcile one WolConfig
///
/// Validates the spec, reconciles the agent fleet, rebuilds the global
/// mapping from all configs, and writes the outcome back to status. The
/// requeue period is the config's `cacheTTL` so the mapping refreshes
/// periodically even without spec or VM changes.
#[instrument(skip(config, ctx), fields(config = %config.name_any()))]
pub async fn reconcile(config: Arc<WolConfig>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!(
        mode = %config.spec.discovery_mode,
        ports = ?config.spec.wol_ports,
        "reconciling WolConfig"
    );

    let effective = match config.spec.effective() {
        Err(e) => {
            warn!(error = %e, "invalid WolConfig");
            update_status(&config, &ctx, StatusUpdate::failed(REASON_INVALID_CONFIG, &e)).await?;
            // Validation errors require a spec change; do not requeue.
            return Ok(Action::await_change());
        }
        Ok(spec) => spec,
    };

    if let Err(e) = reconcile_fleet(&config, &effective, &ctx.fleet_params, ctx.fleets.as_ref()).await
    {
        error!(error = %e, "failed to reconcile agent fleet");
        update_status(
            &config,
            &ctx,
            StatusUpdate::failed(
                REASON_AGENT_FAILED,
                &format!("failed to reconcile agent DaemonSet: {e}"),
            ),
        )
        .await?;
        return Ok(Action::requeue(TRANSIENT_REQUEUE));
    }

    let managed_vms = match rebuild_mapping(&ctx).await {
        Err(e) => {
            error!(error = %e, "failed to rebuild MAC mapping");
            update_status(
                &config,
                &ctx,
                StatusUpdate::failed(
                    REASON_INVALID_CONFIG,
                    &format!("failed to refresh mapping: {e}"),
                ),
            )
            .await?;
            return Ok(Action::requeue(TRANSIENT_REQUEUE));
        }
        Ok(count) => count,
    };

    let agent_status = match fleet_counts(&config, &ctx.fleet_params.namespace, ctx.fleets.as_ref())
        .await
    {
        Ok(counts) => counts.map(|(desired, ready, available)| AgentStatus {
            daemon_set_name: fleet_name(&config),
            desired_number_scheduled: desired,
            number_ready: ready,
            number_available: available,
        }),
        Err(e) => {
            // Not fatal; status simply keeps its previous fleet counts.
            warn!(error = %e, "failed to read agent fleet status");
            None
        }
    };

    update_status(
        &config,
        &ctx,
        StatusUpdate::succeeded(managed_vms, agent_status),
    )
    .await?;

    info!(managed_vms, "successfully reconciled WolConfig");

    // cacheTTL is guaranteed positive after defaulting.
    Ok(Action::requeue(Duration::from_secs(
        effective.cache_ttl as u64,
    )))
}

/// Error policy: transient failures retry on a fixed delay.
pub fn error_policy(config: Arc<WolConfig>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        config = %config.name_any(),
        error = %error,
        "reconciliation failed"
    );
    Action::requeue(TRANSIENT_REQUEUE)
}

enum StatusUpdate {
    Failed { reason: String, message: String },
    Succeeded { managed_vms: i32, agent_status: Option<AgentStatus> },
}

impl StatusUpdate {
    fn failed(reason: &str, error: &dyn std::fmt::Display) -> Self {
        Self::Failed {
            reason: reason.to_string(),
            message: error.to_string(),
        }
    }

    fn succeeded(managed_vms: i32, agent_status: Option<AgentStatus>) -> Self {
        Self::Succeeded {
            managed_vms,
            agent_status,
        }
    }
}

async fn update_status(
    config: &WolConfig,
    ctx: &Context,
    update: StatusUpdate,
) -> Result<(), Error> {
    let mut status = config.status.clone().unwrap_or_default();

    let condition = match &update {
        StatusUpdate::Failed { reason, message } => {
            Condition::new(CONDITION_READY, ConditionStatus::False, reason, message)
        }
        StatusUpdate::Succeeded { .. } => Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            REASON_MAPPING_UPDATED,
            "VM mapping refreshed successfully",
        ),
    };
    status.set_condition(condition.with_observed_generation(config.metadata.generation));

    if let StatusUpdate::Succeeded {
        managed_vms,
        agent_status,
    } = update
    {
        status.managed_vms = managed_vms;
        status.last_sync = Some(Utc::now());
        if agent_status.is_some() {
            status.agent_status = agent_status;
        }
    }

    ctx.configs.patch_status(&config.name_any(), &status).await
}

/// Rebuilds the global mapping table from every WolConfig in OR fashion and
/// installs it atomically. Returns the resulting table size.
pub async fn rebuild_mapping(ctx: &Context) -> Result<i32, Error> {
    let configs = ctx.configs.list().await?;
    let mut mapping: HashMap<String, VmBinding> = HashMap::new();

    // All-mode configs contribute their namespaces to one union; an empty
    // union means every namespace.
    let mut namespaces: BTreeSet<String> = BTreeSet::new();
    let mut any_all_mode = false;
    for config in &configs {
        if config.spec.discovery_mode == DiscoveryMode::All {
            any_all_mode = true;
            namespaces.extend(config.spec.namespace_selectors.iter().cloned());
        }
    }
    if any_all_mode {
        if namespaces.is_empty() {
            let vms = ctx.vms.list_vms(None, None).await?;
            collect(&mut mapping, vms);
        } else {
            for namespace in &namespaces {
                match ctx.vms.list_vms(Some(namespace), None).await {
                    Ok(vms) => collect(&mut mapping, vms),
                    Err(e) => {
                        // One unlistable namespace never aborts the rebuild.
                        warn!(namespace = %namespace, error = %e, "failed to list VMs in namespace, skipping");
                    }
                }
            }
        }
    }

    for config in &configs {
        if config.spec.discovery_mode != DiscoveryMode::LabelSelector {
            continue;
        }
        let Some(selector) = &config.spec.vm_selector else {
            // Tolerated here; validation flags it on that config's own
            // reconcile.
            continue;
        };
        if config.spec.namespace_selectors.is_empty() {
            match ctx.vms.list_vms(None, Some(selector)).await {
                Ok(vms) => collect(&mut mapping, vms),
                Err(e) => {
                    warn!(config = %config.name_any(), error = %e, "failed to list VMs with selector, skipping");
                }
            }
        } else {
            for namespace in &config.spec.namespace_selectors {
                match ctx.vms.list_vms(Some(namespace), Some(selector)).await {
                    Ok(vms) => collect(&mut mapping, vms),
                    Err(e) => {
                        warn!(
                            config = %config.name_any(),
                            namespace = %namespace,
                            error = %e,
                            "failed to list VMs in namespace with selector, skipping"
                        );
                    }
                }
            }
        }
    }

    // Explicit mappings last: a directly configured binding shadows a
    // discovered one for the same MAC.
    for config in &configs {
        if config.spec.discovery_mode != DiscoveryMode::Explicit {
            continue;
        }
        for entry in &config.spec.explicit_mappings {
            mapping.insert(
                normalize_mac(&entry.mac_address),
                VmBinding {
                    name: entry.vm_name.clone(),
                    namespace: entry.namespace.clone(),
                },
            );
        }
    }

    ctx.mapper.install(mapping);
    let size = ctx.mapper.len();
    ctx.metrics.managed_vms.set(size as f64);
    info!(managed_vms = size, "MAC mapping refreshed");
    Ok(size as i32)
}

fn collect(mapping: &mut HashMap<String, VmBinding>, vms: Vec<crate::discovery::DiscoveredVm>) {
    for vm in vms {
        for mac in vm.mac_addresses {
            debug!(mac = %mac, vm = %vm.name, namespace = %vm.namespace, "discovered VM MAC");
            mapping.insert(
                mac,
                VmBinding {
                    name: vm.name.clone(),
                    namespace: vm.namespace.clone(),
                },
            );
        }
    }
}

/// Runs the WolConfig controller until shutdown.
///
/// Watches WolConfigs, owns the agent DaemonSets, and additionally watches
/// VirtualMachines so VM create/update/delete refreshes the mapping: any VM
/// change maps to a reconcile of every WolConfig.
pub async fn run(client: Client, ctx: Arc<Context>) -> crate::Result<()> {
    let configs: Api<WolConfig> = Api::all(client.clone());
    let fleets: Api<DaemonSet> = Api::namespaced(client.clone(), &ctx.fleet_params.namespace);
    let vm_resource = virtual_machine_resource();
    let vms: Api<DynamicObject> = Api::all_with(client, &vm_resource);

    let controller = Controller::new(configs, watcher::Config::default());
    let store = controller.store();

    info!("starting WolConfig controller");
    controller
        .owns(fleets, watcher::Config::default())
        .watches_with(vms, vm_resource, watcher::Config::default(), move |_vm| {
            store
                .state()
                .iter()
                .map(|config| ObjectRef::from_obj(config.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "reconciliation completed"),
                Err(e) => error!(error = ?e, "reconciliation error"),
            }
        })
        .await;

    info!("WolConfig controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fleet::MockFleetStore;
    use crate::crd::{MacVmMapping, WolConfigSpec};
    use crate::discovery::DiscoveredVm;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use parking_lot::Mutex;

    /// Closure-backed [`VmLister`] fake.
    struct FakeVmLister {
        #[allow(clippy::type_complexity)]
        handler: Box<
            dyn Fn(Option<&str>, Option<&LabelSelector>) -> Result<Vec<DiscoveredVm>, Error>
                + Send
                + Sync,
        >,
    }

    impl FakeVmLister {
        fn new(
            handler: impl Fn(Option<&str>, Option<&LabelSelector>) -> Result<Vec<DiscoveredVm>, Error>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
            })
        }

        fn empty() -> Arc<Self> {
            Self::new(|_, _| Ok(vec![]))
        }
    }

    #[async_trait]
    impl VmLister for FakeVmLister {
        async fn list_vms(
            &self,
            namespace: Option<&str>,
            selector: Option<&LabelSelector>,
        ) -> Result<Vec<DiscoveredVm>, Error> {
            (self.handler)(namespace, selector)
        }
    }

    fn config(name: &str, spec: WolConfigSpec) -> WolConfig {
        let mut config = WolConfig::new(name, spec);
        config.metadata.uid = Some(format!("uid-{name}"));
        config.metadata.generation = Some(1);
        config
    }

    fn vm(namespace: &str, name: &str, macs: &[&str]) -> DiscoveredVm {
        DiscoveredVm {
            name: name.to_string(),
            namespace: namespace.to_string(),
            mac_addresses: macs.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn params() -> FleetParams {
        FleetParams {
            agent_image: "ghcr.io/wakevirt/wakevirt:v0.2.0".to_string(),
            operator_address: "wakevirt-grpc.wakevirt-system.svc:9090".to_string(),
            namespace: "wakevirt-system".to_string(),
        }
    }

    /// ConfigStore fake capturing status patches.
    #[derive(Default)]
    struct FakeConfigStore {
        configs: Vec<WolConfig>,
        statuses: Mutex<Vec<(String, WolConfigStatus)>>,
        annotations: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeConfigStore {
        fn with(configs: Vec<WolConfig>) -> Arc<Self> {
            Arc::new(Self {
                configs,
                ..Default::default()
            })
        }

        fn last_status(&self) -> (String, WolConfigStatus) {
            self.statuses.lock().last().cloned().expect("status patched")
        }
    }

    #[async_trait]
    impl ConfigStore for FakeConfigStore {
        async fn list(&self) -> Result<Vec<WolConfig>, Error> {
            Ok(self.configs.clone())
        }

        async fn get(&self, name: &str) -> Result<Option<WolConfig>, Error> {
            Ok(self.configs.iter().find(|c| c.name_any() == name).cloned())
        }

        async fn patch_status(&self, name: &str, status: &WolConfigStatus) -> Result<(), Error> {
            self.statuses
                .lock()
                .push((name.to_string(), status.clone()));
            Ok(())
        }

        async fn annotate(&self, name: &str, key: &str, value: &str) -> Result<(), Error> {
            self.annotations
                .lock()
                .push((name.to_string(), key.to_string(), value.to_string()));
            Ok(())
        }
    }

    fn context(
        configs: Arc<FakeConfigStore>,
        fleets: MockFleetStore,
        vms: Arc<FakeVmLister>,
    ) -> Arc<Context> {
        Arc::new(Context::with_stores(
            configs,
            Arc::new(fleets),
            vms,
            Arc::new(MacMapper::new()),
            Arc::new(WolMetrics::new().unwrap()),
            params(),
        ))
    }

    fn permissive_fleets() -> MockFleetStore {
        let mut fleets = MockFleetStore::new();
        fleets.expect_get().returning(|_, _| Ok(None));
        fleets.expect_create().returning(|_| Ok(()));
        fleets.expect_update().returning(|_| Ok(()));
        fleets
    }

    // =========================================================================
    // Mapping rebuild (OR merge)
    // =========================================================================

    /// Story: the mapping is the union of every config's contribution
    ///
    /// An All-mode config discovering `default` plus an Explicit config for
    /// `production` yield one table containing both bindings.
    #[tokio::test]
    async fn rebuild_unions_all_configs() {
        let all_mode = config(
            "discover",
            WolConfigSpec {
                namespace_selectors: vec!["default".to_string()],
                ..Default::default()
            },
        );
        let explicit = config(
            "pinned",
            WolConfigSpec {
                discovery_mode: DiscoveryMode::Explicit,
                explicit_mappings: vec![MacVmMapping {
                    mac_address: "02:F1:EF:00:00:0B".to_string(),
                    vm_name: "db-primary".to_string(),
                    namespace: "production".to_string(),
                }],
                ..Default::default()
            },
        );
        let configs = FakeConfigStore::with(vec![all_mode, explicit]);

        let vms = FakeVmLister::new(|ns, sel| {
            assert_eq!(ns, Some("default"));
            assert!(sel.is_none());
            Ok(vec![vm("default", "test-vm", &["52:54:00:12:34:56"])])
        });

        let ctx = context(configs, permissive_fleets(), vms);
        let count = rebuild_mapping(&ctx).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            ctx.mapper.lookup("52:54:00:12:34:56").unwrap().name,
            "test-vm"
        );
        // Scenario S4: the explicit entry resolves to production/db-primary.
        let pinned = ctx.mapper.lookup("02:f1:ef:00:00:0b").unwrap();
        assert_eq!(pinned.name, "db-primary");
        assert_eq!(pinned.namespace, "production");
        // The managed-VMs gauge tracks the table size.
        assert_eq!(ctx.metrics.managed_vms.get() as i64, 2);
    }

    /// Story: an All-mode config with no namespaces discovers everywhere
    #[tokio::test]
    async fn rebuild_with_empty_namespace_union_lists_all() {
        let configs = FakeConfigStore::with(vec![config("wide", WolConfigSpec::default())]);

        let vms = FakeVmLister::new(|ns, sel| {
            assert!(ns.is_none(), "empty union must list all namespaces");
            assert!(sel.is_none());
            Ok(vec![
                vm("default", "a", &["52:54:00:00:00:01"]),
                vm("prod", "b", &["52:54:00:00:00:02"]),
            ])
        });

        let ctx = context(configs, permissive_fleets(), vms);
        assert_eq!(rebuild_mapping(&ctx).await.unwrap(), 2);
    }

    /// Story: label-selector configs list with their selector
    #[tokio::test]
    async fn rebuild_applies_label_selectors() {
        let selector = LabelSelector {
            match_labels: Some(std::collections::BTreeMap::from([(
                "wol".to_string(),
                "enabled".to_string(),
            )])),
            match_expressions: None,
        };
        let configs = FakeConfigStore::with(vec![config(
            "selective",
            WolConfigSpec {
                discovery_mode: DiscoveryMode::LabelSelector,
                vm_selector: Some(selector),
                namespace_selectors: vec!["lab".to_string()],
                ..Default::default()
            },
        )]);

        let vms = FakeVmLister::new(|ns, sel| {
            assert_eq!(ns, Some("lab"));
            assert!(sel.is_some(), "selector must be passed through");
            Ok(vec![vm("lab", "labelled", &["52:54:00:00:00:03"])])
        });

        let ctx = context(configs, permissive_fleets(), vms);
        assert_eq!(rebuild_mapping(&ctx).await.unwrap(), 1);
        assert!(ctx.mapper.lookup("52:54:00:00:00:03").is_some());
    }

    /// Story: one unlistable namespace is skipped, not fatal
    #[tokio::test]
    async fn rebuild_survives_namespace_list_failure() {
        let configs = FakeConfigStore::with(vec![config(
            "partial",
            WolConfigSpec {
                namespace_selectors: vec!["broken".to_string(), "default".to_string()],
                ..Default::default()
            },
        )]);

        let vms = FakeVmLister::new(|ns, _| match ns {
            Some("broken") => Err(Error::transport("namespace list failed")),
            Some("default") => Ok(vec![vm("default", "survivor", &["52:54:00:00:00:04"])]),
            other => panic!("unexpected namespace {other:?}"),
        });

        let ctx = context(configs, permissive_fleets(), vms);
        // The rebuild completes with the listable namespace's VMs.
        assert_eq!(rebuild_mapping(&ctx).await.unwrap(), 1);
    }

    /// Story: a rebuild replaces stale entries
    ///
    /// Property: the table equals the union of current contributions; keys
    /// from earlier rebuilds disappear.
    #[tokio::test]
    async fn rebuild_discards_previous_table() {
        let configs = FakeConfigStore::with(vec![config("wide", WolConfigSpec::default())]);

        let first = Mutex::new(true);
        let vms = FakeVmLister::new(move |_, _| {
            let mut first = first.lock();
            if *first {
                *first = false;
                Ok(vec![vm("default", "old", &["52:54:00:00:00:05"])])
            } else {
                Ok(vec![vm("default", "new", &["52:54:00:00:00:06"])])
            }
        });

        let ctx = context(configs, permissive_fleets(), vms);
        rebuild_mapping(&ctx).await.unwrap();
        assert!(ctx.mapper.lookup("52:54:00:00:00:05").is_some());

        rebuild_mapping(&ctx).await.unwrap();
        assert!(ctx.mapper.lookup("52:54:00:00:00:05").is_none());
        assert!(ctx.mapper.lookup("52:54:00:00:00:06").is_some());
        assert_eq!(ctx.metrics.managed_vms.get() as i64, 1);
    }

    // =========================================================================
    // Reconcile outcomes
    // =========================================================================

    /// Story: a healthy reconcile reports Ready and requeues on the TTL
    #[tokio::test]
    async fn reconcile_success_updates_status() {
        let cfg = config(
            "lab",
            WolConfigSpec {
                namespace_selectors: vec!["default".to_string()],
                cache_ttl: 120,
                ..Default::default()
            },
        );
        let configs = FakeConfigStore::with(vec![cfg.clone()]);

        let vms =
            FakeVmLister::new(|_, _| Ok(vec![vm("default", "test-vm", &["52:54:00:12:34:56"])]));

        let ctx = context(configs.clone(), permissive_fleets(), vms);
        let action = reconcile(Arc::new(cfg), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(120)));

        let (name, status) = configs.last_status();
        assert_eq!(name, "lab");
        assert_eq!(status.managed_vms, 1);
        assert!(status.last_sync.is_some());
        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, REASON_MAPPING_UPDATED);
        assert_eq!(ready.observed_generation, Some(1));
    }

    /// Story: validation failure surfaces InvalidConfig and waits for a
    /// spec change instead of requeueing
    #[tokio::test]
    async fn reconcile_invalid_config_awaits_change() {
        let cfg = config(
            "broken",
            WolConfigSpec {
                wol_ports: vec![99999],
                ..Default::default()
            },
        );
        let configs = FakeConfigStore::with(vec![cfg.clone()]);
        let ctx = context(configs.clone(), MockFleetStore::new(), FakeVmLister::empty());

        let action = reconcile(Arc::new(cfg), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let (_, status) = configs.last_status();
        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_INVALID_CONFIG);
        assert!(ready.message.contains("99999"));
    }

    /// Story: fleet failure surfaces AgentFailed and retries in 30 s
    #[tokio::test]
    async fn reconcile_fleet_failure_requeues() {
        let cfg = config("lab", WolConfigSpec::default());
        let configs = FakeConfigStore::with(vec![cfg.clone()]);

        let mut fleets = MockFleetStore::new();
        fleets
            .expect_get()
            .returning(|_, _| Err(Error::transport("api server down")));

        let ctx = context(configs.clone(), fleets, FakeVmLister::empty());
        let action = reconcile(Arc::new(cfg), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let (_, status) = configs.last_status();
        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_AGENT_FAILED);
    }

    /// Story: the Ready condition transitions False -> True across
    /// reconciles of the same object
    #[tokio::test]
    async fn ready_condition_recovers_after_fix() {
        // First pass: invalid spec.
        let broken = config(
            "flip",
            WolConfigSpec {
                cache_ttl: -5,
                ..Default::default()
            },
        );
        let configs = FakeConfigStore::with(vec![broken.clone()]);
        let ctx = context(configs.clone(), MockFleetStore::new(), FakeVmLister::empty());
        reconcile(Arc::new(broken), ctx).await.unwrap();
        let (_, status) = configs.last_status();
        assert_eq!(
            status.condition(CONDITION_READY).unwrap().status,
            ConditionStatus::False
        );

        // Second pass: fixed spec, carrying the previous status forward.
        let mut fixed = config("flip", WolConfigSpec::default());
        fixed.status = Some(status);
        let configs = FakeConfigStore::with(vec![fixed.clone()]);
        let ctx = context(configs.clone(), permissive_fleets(), FakeVmLister::empty());
        reconcile(Arc::new(fixed), ctx).await.unwrap();

        let (_, status) = configs.last_status();
        assert_eq!(status.conditions.len(), 1, "single Ready entry");
        assert_eq!(
            status.condition(CONDITION_READY).unwrap().status,
            ConditionStatus::True
        );
    }

    /// Story: fleet status counts land in the WolConfig status
    #[tokio::test]
    async fn reconcile_records_agent_status() {
        use k8s_openapi::api::apps::v1::DaemonSetStatus;

        let cfg = config("lab", WolConfigSpec::default());
        let configs = FakeConfigStore::with(vec![cfg.clone()]);

        let fleet_obj = {
            let spec = cfg.spec.effective().unwrap();
            let mut fleet = super::super::fleet::build_fleet(&cfg, &spec, &params());
            fleet.status = Some(DaemonSetStatus {
                desired_number_scheduled: 3,
                number_ready: 3,
                number_available: Some(3),
                ..Default::default()
            });
            fleet
        };
        let mut fleets = MockFleetStore::new();
        fleets
            .expect_get()
            .returning(move |_, _| Ok(Some(fleet_obj.clone())));
        fleets.expect_update().returning(|_| Ok(()));

        let ctx = context(configs.clone(), fleets, FakeVmLister::empty());
        reconcile(Arc::new(cfg), ctx).await.unwrap();

        let (_, status) = configs.last_status();
        let agent = status.agent_status.unwrap();
        assert_eq!(agent.daemon_set_name, "wol-agent-lab");
        assert_eq!(agent.desired_number_scheduled, 3);
        assert_eq!(agent.number_ready, 3);
        assert_eq!(agent.number_available, 3);
    }

    /// Story: the error policy retries transient failures after 30 s
    #[tokio::test]
    async fn error_policy_requeues() {
        let cfg = Arc::new(config("lab", WolConfigSpec::default()));
        let ctx = context(
            FakeConfigStore::with(vec![]),
            MockFleetStore::new(),
            FakeVmLister::empty(),
        );
        let action = error_policy(cfg, &Error::transport("boom"), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }
}
