//! Per-node Wake-on-LAN capture agent
//!
//! One agent runs on every cluster node (host network). It captures magic
//! packets on every configured UDP port and, where the platform and
//! `CAP_NET_RAW` allow, as raw EtherType `0x0842` frames on eligible
//! interfaces. Fresh MACs (2 s local dedupe) are shipped to the operator as
//! gRPC events; the operator's verdict is logged but not acted on.
//!
//! The agent is stateless beyond the dedupe cache: on crash or drain a
//! future packet simply re-arms the pipeline.

pub mod health;
#[cfg(target_os = "linux")]
pub mod raw;
pub mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

use crate::metrics::AgentMetrics;
use crate::proto::wol_service_client::WolServiceClient;
use crate::proto::{HealthCheckRequest, WolEvent};
use crate::{Error, DEFAULT_WOL_PORT, MAX_RPC_MESSAGE_BYTES};

use health::AgentHealth;

/// Window during which repeated captures of one MAC are collapsed locally.
pub const LOCAL_DEDUPE_TTL: Duration = Duration::from_secs(2);
/// How often the local dedupe cache is swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline on each event report RPC.
const REPORT_DEADLINE: Duration = Duration::from_secs(5);
/// Budget from cancellation signal to agent exit.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(2);
/// Source address attributed to raw L2 captures, which have no IP endpoint.
const RAW_SOURCE_IP: &str = "255.255.255.255";

/// Agent runtime configuration, assembled from CLI flags.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Kubernetes node name this agent runs on.
    pub node_name: String,
    /// Operator gRPC address (`host:port`).
    pub operator_address: String,
    /// UDP ports to capture on.
    pub ports: Vec<u16>,
    /// Whether to attempt raw Ethernet capture.
    pub enable_raw: bool,
    /// Bind address for the health/metrics HTTP server.
    pub health_addr: SocketAddr,
}

/// Parses the `--ports` CSV flag. Empty input defaults to the standard WoL
/// port; any port outside 1-65535 is an error.
pub fn parse_ports(input: &str) -> Result<Vec<u16>, Error> {
    let mut ports = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let port: u32 = part
            .parse()
            .map_err(|_| Error::validation(format!("invalid port {part:?}")))?;
        if !(1..=65535).contains(&port) {
            return Err(Error::validation(format!(
                "port {port} out of range (must be 1-65535)"
            )));
        }
        ports.push(port as u16);
    }
    if ports.is_empty() {
        ports.push(DEFAULT_WOL_PORT);
    }
    Ok(ports)
}

/// Local MAC dedupe cache: a MAC seen within the TTL is not re-shipped.
pub struct DedupeCache {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupeCache {
    /// Creates a cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns true iff the MAC is fresh, recording it as seen now.
    pub fn should_process(&self, mac: &str) -> bool {
        let mut seen = self.seen.lock();
        let now = Instant::now();
        if let Some(last) = seen.get(mac) {
            if now.duration_since(*last) < self.ttl {
                return false;
            }
        }
        seen.insert(mac.to_string(), now);
        true
    }

    /// Evicts entries older than three TTLs. Returns the remaining size.
    pub fn sweep(&self) -> usize {
        let mut seen = self.seen.lock();
        let horizon = self.ttl * 3;
        let now = Instant::now();
        seen.retain(|_, last| now.duration_since(*last) <= horizon);
        seen.len()
    }

    /// Current number of cached MACs.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// True when no MAC is cached.
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

/// State shared between capture paths and the shipping task.
struct AgentShared {
    node_name: String,
    client: WolServiceClient<Channel>,
    dedupe: DedupeCache,
    metrics: Arc<AgentMetrics>,
}

impl AgentShared {
    /// Funnel for both capture paths: local dedupe, then ship in background.
    fn dispatch(self: &Arc<Self>, mac: String, source: Option<SocketAddr>, packet_size: usize) {
        if !self.dedupe.should_process(&mac) {
            debug!(mac = %mac, "skipping duplicate packet (local dedupe cache)");
            return;
        }
        self.metrics.dedupe_cache_size.set(self.dedupe.len() as f64);
        self.metrics.packets_total.inc();

        let shared = self.clone();
        tokio::spawn(async move {
            shared.report(mac, source, packet_size).await;
        });
    }

    /// Ships one event to the operator. Failures are counted and the event
    /// dropped; a future packet will re-arm it.
    async fn report(&self, mac: String, source: Option<SocketAddr>, packet_size: usize) {
        let started = Instant::now();
        let event = WolEvent {
            mac_address: mac.clone(),
            timestamp: Some(SystemTime::now().into()),
            node_name: self.node_name.clone(),
            source_ip: source
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|| RAW_SOURCE_IP.to_string()),
            source_port: source.map(|a| a.port() as u32).unwrap_or(0),
            packet_size: packet_size as u32,
        };

        let mut client = self.client.clone();
        let response =
            match tokio::time::timeout(REPORT_DEADLINE, client.report_wol_event(event)).await {
                Err(_) => {
                    error!(mac = %mac, "timed out reporting WoL event to operator");
                    self.metrics.errors_total.inc();
                    return;
                }
                Ok(Err(e)) => {
                    error!(mac = %mac, error = %e, "failed to report WoL event to operator");
                    self.metrics.errors_total.inc();
                    return;
                }
                Ok(Ok(response)) => response.into_inner(),
            };

        info!(
            mac = %mac,
            status = ?response.status(),
            message = %response.message,
            was_duplicate = response.was_duplicate,
            processing_time_ms = response.processing_time_ms,
            total_time_ms = started.elapsed().as_millis() as u64,
            "event reported to operator"
        );

        if let Some(vm) = response.vm_info {
            info!(
                mac = %mac,
                vm = %vm.name,
                namespace = %vm.namespace,
                state = %vm.current_state,
                "VM action initiated by operator"
            );
        }
    }
}

/// Runs the agent until the token is cancelled.
///
/// Startup order: gRPC channel (with a non-fatal operator health probe),
/// UDP sockets, raw listeners (best-effort), health server, sweep. Shutdown
/// completes within [`SHUTDOWN_BUDGET`] of cancellation.
pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> crate::Result<()> {
    let ports_csv = config
        .ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    info!(
        node = %config.node_name,
        operator = %config.operator_address,
        ports = %ports_csv,
        "starting WoL agent"
    );

    let metrics = Arc::new(AgentMetrics::new().map_err(Error::from)?);
    metrics.set_info(&config.node_name, &ports_csv, &config.operator_address);

    // The channel is lazy: event shipping establishes the connection on
    // demand, so an unreachable operator never blocks capture startup.
    let endpoint = Endpoint::from_shared(format!("http://{}", config.operator_address))
        .map_err(|e| Error::transport(format!("invalid operator address: {e}")))?
        .connect_timeout(Duration::from_secs(10));
    let channel = endpoint.connect_lazy();
    let mut client = WolServiceClient::new(channel)
        .max_decoding_message_size(MAX_RPC_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_RPC_MESSAGE_BYTES);

    let agent_health = AgentHealth::new(metrics.registry.clone());
    agent_health
        .rpc_connected
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let probe = HealthCheckRequest {
        service: "wol".to_string(),
    };
    match tokio::time::timeout(Duration::from_secs(5), client.health_check(probe)).await {
        Ok(Ok(response)) => {
            info!(status = ?response.into_inner().status(), "operator health check")
        }
        Ok(Err(e)) => warn!(error = %e, "operator health check failed, continuing anyway"),
        Err(_) => warn!("operator health check timed out, continuing anyway"),
    }

    let shared = Arc::new(AgentShared {
        node_name: config.node_name.clone(),
        client,
        dedupe: DedupeCache::new(LOCAL_DEDUPE_TTL),
        metrics: metrics.clone(),
    });

    // One capture socket per configured port; a failed bind disables only
    // that port.
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut bound_ports = 0usize;
    for &port in &config.ports {
        match udp::UdpCapture::bind(port) {
            Err(e) => {
                error!(port, error = %e, "failed to bind WoL UDP port, continuing with remaining ports");
            }
            Ok(capture) => {
                bound_ports += 1;
                let shared = shared.clone();
                let token = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    capture
                        .run(token, move |mac, addr, size| {
                            shared.dispatch(mac, Some(addr), size);
                        })
                        .await;
                }));
            }
        }
    }
    if bound_ports > 0 {
        agent_health
            .udp_bound
            .store(true, std::sync::atomic::Ordering::Relaxed);
    } else {
        warn!("no WoL UDP port could be bound, agent will not become ready");
    }

    // Raw L2 capture is a capability, not a requirement.
    #[cfg(target_os = "linux")]
    let raw_listeners: Vec<raw::RawListener> = if config.enable_raw {
        let (frames_tx, mut frames_rx) = tokio::sync::mpsc::channel::<raw::RawFrame>(64);
        match start_raw_listeners(frames_tx) {
            Ok(listeners) => {
                let shared = shared.clone();
                let token = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            frame = frames_rx.recv() => match frame {
                                None => return,
                                Some(frame) => {
                                    shared.dispatch(
                                        frame.target_mac,
                                        None,
                                        crate::packet::MAGIC_PACKET_LEN,
                                    );
                                }
                            }
                        }
                    }
                }));
                listeners
            }
            Err(e) => {
                warn!(error = %e, "raw Ethernet capture unavailable, continuing with UDP only");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };
    #[cfg(not(target_os = "linux"))]
    if config.enable_raw {
        warn!("raw Ethernet capture is not supported on this platform, continuing with UDP only");
    }

    // Health server and dedupe sweep.
    tasks.push(tokio::spawn({
        let health = agent_health.clone();
        let token = shutdown.clone();
        let addr = config.health_addr;
        async move {
            if let Err(e) = health::serve(addr, health, token).await {
                error!(error = %e, "health server failed");
            }
        }
    }));
    tasks.push(tokio::spawn({
        let shared = shared.clone();
        let token = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let remaining = shared.dedupe.sweep();
                        shared.metrics.dedupe_cache_size.set(remaining as f64);
                        debug!(remaining, "swept local dedupe cache");
                    }
                }
            }
        }
    }));

    info!("WoL agent started successfully");
    shutdown.cancelled().await;
    info!("stopping WoL agent");

    // Raw listener threads wake via SHUT_RD and are joined here; async tasks
    // observe the token within their one-second read deadline.
    #[cfg(target_os = "linux")]
    for listener in raw_listeners {
        listener.stop();
    }
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        warn!("some capture tasks did not stop within the shutdown budget");
    }

    info!("WoL agent stopped");
    Ok(())
}

#[cfg(target_os = "linux")]
fn start_raw_listeners(
    frames: tokio::sync::mpsc::Sender<raw::RawFrame>,
) -> crate::Result<Vec<raw::RawListener>> {
    let interfaces = raw::candidate_interfaces()
        .map_err(|e| Error::capture(format!("failed to detect network interfaces: {e}")))?;
    if interfaces.is_empty() {
        return Err(Error::capture(
            "no suitable network interfaces found for WoL listening",
        ));
    }

    let mut listeners = Vec::new();
    for iface in &interfaces {
        match raw::RawListener::start(iface, frames.clone()) {
            Ok(listener) => listeners.push(listener),
            Err(e) => error!(interface = %iface.name, error = %e, "failed to start raw WoL listener"),
        }
    }

    if listeners.is_empty() {
        return Err(Error::capture("no raw WoL listeners started successfully"));
    }
    let names: Vec<_> = listeners.iter().map(|l| l.interface().to_string()).collect();
    info!(
        count = listeners.len(),
        interfaces = %names.join(", "),
        "raw Ethernet WoL listeners started"
    );
    Ok(listeners)
}
