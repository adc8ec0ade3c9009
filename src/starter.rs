//! VirtualMachine start handling
//!
//! Starting a KubeVirt VM is a spec patch, but the patch depends on how the
//! VM is configured to run. VMs with a single-shot or manual run strategy
//! (`Once`, `RerunOnFailure`, `Manual`) are temporarily switched to `Always`
//! and the original strategy is restored once the VM reports running. The
//! restore poller is keyed by VM identity so that repeated wakes for the
//! same VM never race each other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::Client;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::discovery::virtual_machine_resource;
use crate::Error;

/// How long the restore poller waits between VM status checks.
const RESTORE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Maximum restore poll attempts (5 s * 60 = 5 minutes).
const RESTORE_MAX_ATTEMPTS: u32 = 60;

/// Field manager used for VM spec patches.
const FIELD_MANAGER: &str = "wakevirt-operator";

/// Starts VirtualMachines in response to Wake-on-LAN events.
///
/// The aggregator only depends on this trait; the KubeVirt implementation
/// lives below and tests substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmStarter: Send + Sync {
    /// Initiates a start of the given VM. Returns once the start has been
    /// requested; it does not wait for the VM to boot.
    async fn start_vm(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Runtime state of a VM relevant to the start decision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmObservedState {
    /// `spec.runStrategy`, if the VM uses run strategies.
    pub run_strategy: Option<String>,
    /// Deprecated `spec.running` field, consulted only without a strategy.
    pub running: Option<bool>,
    /// `status.ready`
    pub ready: bool,
    /// `status.printableStatus` (e.g. "Running", "Starting", "Stopped")
    pub printable_status: Option<String>,
}

impl VmObservedState {
    fn is_running(&self) -> bool {
        self.ready
            || matches!(
                self.printable_status.as_deref(),
                Some("Running") | Some("Starting")
            )
    }
}

/// The patch decision derived from a VM's observed state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartPlan {
    /// VM is already running or starting; nothing to do.
    AlreadyRunning,
    /// Strategy is already `Always` but the VM is down; KubeVirt will bring
    /// it back on its own, no patch needed.
    LeaveAlways,
    /// Patch `spec.runStrategy` to `Always`. When `restore_to` is set the
    /// original strategy must be put back once the VM runs.
    SetStrategyAlways {
        /// Original strategy to restore, if it is a single-shot/manual one.
        restore_to: Option<String>,
    },
    /// Legacy VM without run strategy: patch `spec.running` to true.
    SetRunningTrue,
}

/// Decides how to start a VM given its observed state. Pure; the I/O around
/// it lives in [`KubeVirtStarter`].
pub fn plan_start(state: &VmObservedState) -> StartPlan {
    if let Some(strategy) = state.run_strategy.as_deref() {
        if state.is_running() {
            return StartPlan::AlreadyRunning;
        }
        return match strategy {
            "Once" | "RerunOnFailure" | "Manual" => StartPlan::SetStrategyAlways {
                restore_to: Some(strategy.to_string()),
            },
            "Always" => StartPlan::LeaveAlways,
            _ => StartPlan::SetStrategyAlways { restore_to: None },
        };
    }

    if state.running == Some(true) {
        return StartPlan::AlreadyRunning;
    }
    StartPlan::SetRunningTrue
}

/// Extracts the start-relevant state from a VirtualMachine object.
pub fn observe(vm: &DynamicObject) -> VmObservedState {
    let run_strategy = vm
        .data
        .pointer("/spec/runStrategy")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let running = vm.data.pointer("/spec/running").and_then(|v| v.as_bool());
    let ready = vm
        .data
        .pointer("/status/ready")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let printable_status = vm
        .data
        .pointer("/status/printableStatus")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    VmObservedState {
        run_strategy,
        running,
        ready,
        printable_status,
    }
}

/// Tracks which VMs currently have a strategy-restore poller in flight.
#[derive(Default)]
pub(crate) struct RestoreTracker {
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl RestoreTracker {
    /// Claims the restore slot for a VM. Returns false if a poller is
    /// already running for it.
    pub(crate) fn begin(&self, namespace: &str, name: &str) -> bool {
        self.in_flight
            .lock()
            .insert((namespace.to_string(), name.to_string()))
    }

    /// Releases the restore slot for a VM.
    pub(crate) fn finish(&self, namespace: &str, name: &str) {
        self.in_flight
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Starts VMs through the KubeVirt API.
pub struct KubeVirtStarter {
    client: Client,
    restores: Arc<RestoreTracker>,
}

impl KubeVirtStarter {
    /// Creates a starter using the given Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            restores: Arc::new(RestoreTracker::default()),
        }
    }

    fn vm_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &virtual_machine_resource())
    }

    async fn patch_run_strategy(
        &self,
        namespace: &str,
        name: &str,
        strategy: &str,
    ) -> Result<(), Error> {
        let patch = json!({ "spec": { "runStrategy": strategy } });
        self.vm_api(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    /// Spawns the poller that restores the original run strategy once the VM
    /// reports running. At most one poller exists per VM identity.
    fn schedule_restore(&self, namespace: &str, name: &str, original: String) {
        if !self.restores.begin(namespace, name) {
            debug!(
                vm = %name,
                namespace = %namespace,
                "restore poller already in flight, not spawning another"
            );
            return;
        }

        let api = self.vm_api(namespace);
        let restores = self.restores.clone();
        let namespace = namespace.to_string();
        let name = name.to_string();

        tokio::spawn(async move {
            for _ in 0..RESTORE_MAX_ATTEMPTS {
                tokio::time::sleep(RESTORE_POLL_INTERVAL).await;

                let vm = match api.get(&name).await {
                    Ok(vm) => vm,
                    Err(e) => {
                        warn!(
                            vm = %name,
                            namespace = %namespace,
                            error = %e,
                            "failed to get VM for strategy restore"
                        );
                        continue;
                    }
                };

                let state = observe(&vm);
                let running = state.ready
                    || matches!(state.printable_status.as_deref(), Some("Running"));
                if !running {
                    continue;
                }

                let patch = json!({ "spec": { "runStrategy": original } });
                match api
                    .patch(
                        &name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Merge(&patch),
                    )
                    .await
                {
                    Ok(_) => info!(
                        vm = %name,
                        namespace = %namespace,
                        strategy = %original,
                        "restored original run strategy after VM started"
                    ),
                    Err(e) => warn!(
                        vm = %name,
                        namespace = %namespace,
                        error = %e,
                        "failed to restore original run strategy"
                    ),
                }
                restores.finish(&namespace, &name);
                return;
            }

            info!(
                vm = %name,
                namespace = %namespace,
                "timeout waiting for VM to start, keeping Always strategy"
            );
            restores.finish(&namespace, &name);
        });
    }
}

#[async_trait]
impl VmStarter for KubeVirtStarter {
    async fn start_vm(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let vm = self.vm_api(namespace).get(name).await?;
        let state = observe(&vm);

        match plan_start(&state) {
            StartPlan::AlreadyRunning => {
                info!(vm = %name, namespace = %namespace, "VM is already running");
                Ok(())
            }
            StartPlan::LeaveAlways => {
                debug!(
                    vm = %name,
                    namespace = %namespace,
                    "run strategy is Always, start is up to the virtualization controller"
                );
                Ok(())
            }
            StartPlan::SetRunningTrue => {
                let patch = json!({ "spec": { "running": true } });
                self.vm_api(namespace)
                    .patch(
                        name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Merge(&patch),
                    )
                    .await?;
                info!(vm = %name, namespace = %namespace, "started VM via running field");
                Ok(())
            }
            StartPlan::SetStrategyAlways { restore_to } => {
                self.patch_run_strategy(namespace, name, "Always").await?;
                match restore_to {
                    Some(original) => {
                        info!(
                            vm = %name,
                            namespace = %namespace,
                            original = %original,
                            "temporarily changed run strategy to Always to start VM"
                        );
                        self.schedule_restore(namespace, name, original);
                    }
                    None => {
                        info!(vm = %name, namespace = %namespace, "changed run strategy to start VM");
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(
        run_strategy: Option<&str>,
        running: Option<bool>,
        ready: bool,
        printable: Option<&str>,
    ) -> VmObservedState {
        VmObservedState {
            run_strategy: run_strategy.map(str::to_string),
            running,
            ready,
            printable_status: printable.map(str::to_string),
        }
    }

    // =========================================================================
    // Start plan decisions
    // =========================================================================

    #[test]
    fn running_vm_is_left_alone() {
        let plan = plan_start(&state(Some("Manual"), None, true, None));
        assert_eq!(plan, StartPlan::AlreadyRunning);

        let plan = plan_start(&state(Some("Once"), None, false, Some("Running")));
        assert_eq!(plan, StartPlan::AlreadyRunning);

        // A starting VM counts as running; a second wake must not patch it.
        let plan = plan_start(&state(Some("Manual"), None, false, Some("Starting")));
        assert_eq!(plan, StartPlan::AlreadyRunning);
    }

    #[test]
    fn single_shot_strategies_are_restored_after_start() {
        for strategy in ["Once", "RerunOnFailure", "Manual"] {
            let plan = plan_start(&state(Some(strategy), None, false, Some("Stopped")));
            assert_eq!(
                plan,
                StartPlan::SetStrategyAlways {
                    restore_to: Some(strategy.to_string())
                },
                "strategy {strategy} must be restored after the VM runs"
            );
        }
    }

    #[test]
    fn halted_strategy_switches_without_restore() {
        let plan = plan_start(&state(Some("Halted"), None, false, Some("Stopped")));
        assert_eq!(plan, StartPlan::SetStrategyAlways { restore_to: None });
    }

    #[test]
    fn always_strategy_needs_no_patch() {
        let plan = plan_start(&state(Some("Always"), None, false, Some("Stopped")));
        assert_eq!(plan, StartPlan::LeaveAlways);
    }

    #[test]
    fn legacy_running_field_fallback() {
        assert_eq!(
            plan_start(&state(None, Some(true), false, None)),
            StartPlan::AlreadyRunning
        );
        assert_eq!(
            plan_start(&state(None, Some(false), false, None)),
            StartPlan::SetRunningTrue
        );
        assert_eq!(
            plan_start(&state(None, None, false, None)),
            StartPlan::SetRunningTrue
        );
    }

    // =========================================================================
    // Observed state extraction
    // =========================================================================

    fn vm_object(data: serde_json::Value) -> DynamicObject {
        let mut vm = DynamicObject::new("test-vm", &virtual_machine_resource());
        vm.data = data;
        vm
    }

    #[test]
    fn observe_reads_strategy_and_status() {
        let vm = vm_object(serde_json::json!({
            "spec": { "runStrategy": "Manual" },
            "status": { "ready": false, "printableStatus": "Stopped" }
        }));
        assert_eq!(
            observe(&vm),
            state(Some("Manual"), None, false, Some("Stopped"))
        );
    }

    #[test]
    fn observe_reads_legacy_running_field() {
        let vm = vm_object(serde_json::json!({
            "spec": { "running": true },
            "status": { "ready": true }
        }));
        assert_eq!(observe(&vm), state(None, Some(true), true, None));
    }

    #[test]
    fn observe_tolerates_missing_fields() {
        let vm = vm_object(serde_json::json!({ "spec": {} }));
        assert_eq!(observe(&vm), VmObservedState::default());
    }

    // =========================================================================
    // Restore tracking
    // =========================================================================

    #[test]
    fn restore_tracker_admits_one_poller_per_vm() {
        let tracker = RestoreTracker::default();
        assert!(tracker.begin("production", "db-primary"));
        assert!(!tracker.begin("production", "db-primary"));
        // A different VM is independent.
        assert!(tracker.begin("production", "db-replica"));
        assert_eq!(tracker.len(), 2);

        tracker.finish("production", "db-primary");
        assert!(tracker.begin("production", "db-primary"));
    }
}
