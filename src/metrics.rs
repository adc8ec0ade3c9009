//! Prometheus metrics for the WoL pipeline
//!
//! Two metric families exist because the two processes scrape separately:
//! [`WolMetrics`] is owned by the operator (event counters and the managed-VM
//! gauge), [`AgentMetrics`] by each node agent (dedupe cache gauge and static
//! agent info). Each owns its own registry; nothing is registered globally.

use prometheus::{Counter, Gauge, GaugeVec, Opts, Registry};

/// Operator-side metrics: event counters and the mapping-table gauge.
pub struct WolMetrics {
    /// Registry holding all operator metrics.
    pub registry: Registry,
    /// Number of Wake-on-LAN events received by the operator.
    pub packets_total: Counter,
    /// Number of VM starts initiated via WoL.
    pub vm_started_total: Counter,
    /// Number of errors during WoL handling (VM start or transport failures).
    pub errors_total: Counter,
    /// Number of VMs currently present in the MAC mapping table.
    pub managed_vms: Gauge,
}

impl WolMetrics {
    /// Creates the operator metrics, registered against a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let packets_total = Counter::with_opts(Opts::new(
            "wol_packets_total",
            "Number of Wake-on-LAN packets received",
        ))?;
        let vm_started_total = Counter::with_opts(Opts::new(
            "wol_vm_started_total",
            "Number of VMs started via WOL",
        ))?;
        let errors_total = Counter::with_opts(Opts::new(
            "wol_errors_total",
            "Number of errors during WOL handling",
        ))?;
        let managed_vms = Gauge::with_opts(Opts::new(
            "wol_managed_vms",
            "Number of VMs currently being monitored for WOL",
        ))?;

        registry.register(Box::new(packets_total.clone()))?;
        registry.register(Box::new(vm_started_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(managed_vms.clone()))?;

        Ok(Self {
            registry,
            packets_total,
            vm_started_total,
            errors_total,
            managed_vms,
        })
    }
}

/// Agent-side metrics, exposed on the agent's `/metrics` endpoint.
pub struct AgentMetrics {
    /// Registry holding all agent metrics.
    pub registry: Registry,
    /// Valid WoL packets captured on this node (after local dedupe).
    pub packets_total: Counter,
    /// Event-shipping failures (RPC transport errors, read errors).
    pub errors_total: Counter,
    /// Number of entries in the local deduplication cache.
    pub dedupe_cache_size: Gauge,
    /// Static agent information (node, ports, operator address) as labels.
    pub agent_info: GaugeVec,
}

impl AgentMetrics {
    /// Creates the agent metrics, registered against a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let packets_total = Counter::with_opts(Opts::new(
            "wol_agent_packets_total",
            "Number of valid Wake-on-LAN packets captured on this node",
        ))?;
        let errors_total = Counter::with_opts(Opts::new(
            "wol_agent_errors_total",
            "Number of errors while capturing or reporting WOL events",
        ))?;
        let dedupe_cache_size = Gauge::with_opts(Opts::new(
            "wol_agent_dedupe_cache_size",
            "Number of entries in deduplication cache",
        ))?;
        let agent_info = GaugeVec::new(
            Opts::new("wol_agent_info", "Agent information"),
            &["node", "ports", "operator"],
        )?;

        registry.register(Box::new(packets_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(dedupe_cache_size.clone()))?;
        registry.register(Box::new(agent_info.clone()))?;

        Ok(Self {
            registry,
            packets_total,
            errors_total,
            dedupe_cache_size,
            agent_info,
        })
    }

    /// Records the static agent info gauge once at startup.
    pub fn set_info(&self, node: &str, ports: &str, operator: &str) {
        self.agent_info
            .with_label_values(&[node, ports, operator])
            .set(1.0);
    }
}
