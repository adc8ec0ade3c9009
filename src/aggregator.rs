//! gRPC event aggregation
//!
//! The aggregator terminates the agent event channel. For every reported
//! event it deduplicates globally (10 s window per MAC), resolves the MAC
//! through the mapping table, and initiates the VM start. Duplicate reports
//! within the window are answered with the VM identity of the original
//! response so that every witnessing node learns which VM woke up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, instrument};

use crate::mapper::{normalize_mac, MacMapper};
use crate::metrics::WolMetrics;
use crate::proto::health_check_response::ServingStatus;
use crate::proto::wol_service_server::{WolService, WolServiceServer};
use crate::proto::{
    HealthCheckRequest, HealthCheckResponse, ResponseStatus, VmInfo, WolEvent, WolEventResponse,
};
use crate::starter::VmStarter;
use crate::MAX_RPC_MESSAGE_BYTES;

/// Window during which repeated events for one MAC collapse into one start.
pub const GLOBAL_DEDUPE_WINDOW: Duration = Duration::from_secs(10);
/// How often the dedupe cache is swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct DedupeEntry {
    last_seen: Instant,
    seen_count: u32,
    witnessed_nodes: Vec<String>,
    last_response: Option<WolEventResponse>,
}

/// The WoL event aggregation service.
///
/// Cheap to clone; all state is shared. One clone goes into the tonic
/// server, another drives the background sweep.
#[derive(Clone)]
pub struct Aggregator {
    mapper: Arc<MacMapper>,
    starter: Arc<dyn VmStarter>,
    metrics: Arc<WolMetrics>,
    dedupe: Arc<Mutex<HashMap<String, DedupeEntry>>>,
    window: Duration,
}

impl Aggregator {
    /// Creates a new aggregator over the given mapping table and starter.
    pub fn new(
        mapper: Arc<MacMapper>,
        starter: Arc<dyn VmStarter>,
        metrics: Arc<WolMetrics>,
    ) -> Self {
        Self {
            mapper,
            starter,
            metrics,
            dedupe: Arc::new(Mutex::new(HashMap::new())),
            window: GLOBAL_DEDUPE_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Serves the gRPC endpoint until the token is cancelled.
    pub async fn serve(
        self,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        info!(%addr, "starting WoL gRPC server");
        Server::builder()
            .add_service(
                WolServiceServer::new(self)
                    .max_decoding_message_size(MAX_RPC_MESSAGE_BYTES)
                    .max_encoding_message_size(MAX_RPC_MESSAGE_BYTES),
            )
            .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
            .await
    }

    /// Runs the periodic dedupe cache sweep until the token is cancelled.
    pub async fn run_sweeper(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("started dedupe cache sweep");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping dedupe cache sweep");
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        debug!(evicted, remaining = self.dedupe_len(), "swept dedupe cache");
                    }
                }
            }
        }
    }

    /// Evicts dedupe entries older than twice the window. Returns the number
    /// of evicted entries.
    pub fn sweep(&self) -> usize {
        let mut map = self.dedupe.lock();
        let before = map.len();
        let horizon = self.window * 2;
        let now = Instant::now();
        map.retain(|_, entry| now.duration_since(entry.last_seen) <= horizon);
        before - map.len()
    }

    /// Current number of dedupe entries.
    pub fn dedupe_len(&self) -> usize {
        self.dedupe.lock().len()
    }

    /// Unary event handling shared by both RPC shapes.
    async fn handle_event(&self, event: &WolEvent) -> WolEventResponse {
        let started = Instant::now();
        self.metrics.packets_total.inc();

        info!(
            mac = %event.mac_address,
            node = %event.node_name,
            source = %event.source_ip,
            port = event.source_port,
            packet_size = event.packet_size,
            "received WoL event"
        );

        let mac = normalize_mac(&event.mac_address);

        // Duplicate check and provisional recording happen in one critical
        // section: of two concurrent reports for the same MAC, exactly one
        // proceeds to the lookup and start.
        if let Some(mut response) = self.check_duplicate(&mac, &event.node_name) {
            debug!(mac = %mac, node = %event.node_name, "duplicate WoL event");
            response.processing_time_ms = started.elapsed().as_millis() as i64;
            return response;
        }

        let mut response = match self.mapper.lookup(&mac) {
            None => {
                info!(mac = %mac, "no VM found for MAC address");
                WolEventResponse {
                    status: ResponseStatus::VmNotFound as i32,
                    message: format!("no VM configured for MAC {mac}"),
                    ..Default::default()
                }
            }
            Some(binding) => {
                info!(
                    mac = %mac,
                    vm = %binding.name,
                    namespace = %binding.namespace,
                    node = %event.node_name,
                    "starting VM for WoL request"
                );
                match self.starter.start_vm(&binding.namespace, &binding.name).await {
                    Err(e) => {
                        error!(
                            vm = %binding.name,
                            namespace = %binding.namespace,
                            mac = %mac,
                            error = %e,
                            "failed to start VM"
                        );
                        self.metrics.errors_total.inc();
                        WolEventResponse {
                            status: ResponseStatus::Error as i32,
                            message: format!("failed to start VM: {e}"),
                            vm_info: Some(VmInfo {
                                name: binding.name,
                                namespace: binding.namespace,
                                current_state: String::new(),
                            }),
                            ..Default::default()
                        }
                    }
                    Ok(()) => {
                        self.metrics.vm_started_total.inc();
                        WolEventResponse {
                            status: ResponseStatus::VmStartInitiated as i32,
                            message: format!(
                                "VM start initiated successfully from node {}",
                                event.node_name
                            ),
                            vm_info: Some(VmInfo {
                                name: binding.name,
                                namespace: binding.namespace,
                                current_state: "Starting".to_string(),
                            }),
                            ..Default::default()
                        }
                    }
                }
            }
        };

        response.processing_time_ms = started.elapsed().as_millis() as i64;
        self.record_response(&mac, response.clone());
        response
    }

    /// Checks whether the MAC was seen within the window. A fresh MAC gets a
    /// provisional entry so that concurrent reports observe it; the final
    /// response is filled in by [`Self::record_response`].
    fn check_duplicate(&self, mac: &str, node: &str) -> Option<WolEventResponse> {
        let mut map = self.dedupe.lock();
        let now = Instant::now();

        if let Some(entry) = map.get_mut(mac) {
            if now.duration_since(entry.last_seen) < self.window {
                entry.seen_count += 1;
                entry.witnessed_nodes.push(node.to_string());
                entry.last_seen = now;

                return Some(WolEventResponse {
                    status: ResponseStatus::Duplicate as i32,
                    message: format!(
                        "event already processed recently (seen on {} nodes)",
                        entry.seen_count
                    ),
                    was_duplicate: true,
                    vm_info: entry
                        .last_response
                        .as_ref()
                        .and_then(|r| r.vm_info.clone()),
                    ..Default::default()
                });
            }
        }

        map.insert(
            mac.to_string(),
            DedupeEntry {
                last_seen: now,
                seen_count: 1,
                witnessed_nodes: vec![node.to_string()],
                last_response: None,
            },
        );
        None
    }

    /// Stores the final response for replay to near-term duplicates. Success
    /// and failure are both recorded so a transient start failure does not
    /// cause a retry storm from agents.
    fn record_response(&self, mac: &str, response: WolEventResponse) {
        if let Some(entry) = self.dedupe.lock().get_mut(mac) {
            entry.last_response = Some(response);
        }
    }
}

#[tonic::async_trait]
impl WolService for Aggregator {
    #[instrument(skip(self, request))]
    async fn report_wol_event(
        &self,
        request: Request<WolEvent>,
    ) -> Result<Response<WolEventResponse>, Status> {
        let response = self.handle_event(request.get_ref()).await;
        Ok(Response::new(response))
    }

    type ReportWolEventStreamStream =
        Pin<Box<dyn Stream<Item = Result<WolEventResponse, Status>> + Send + 'static>>;

    #[instrument(skip(self, request))]
    async fn report_wol_event_stream(
        &self,
        request: Request<Streaming<WolEvent>>,
    ) -> Result<Response<Self::ReportWolEventStreamStream>, Status> {
        info!(remote = ?request.remote_addr(), "agent opened WoL event stream");

        let mut inbound = request.into_inner();
        let aggregator = self.clone();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(result) = inbound.next().await {
                match result {
                    Ok(event) => {
                        let response = aggregator.handle_event(&event).await;
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "event stream closed");
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        debug!(service = %request.get_ref().service, "health check requested");

        if self.mapper.is_empty() {
            debug!("health check: no VM mappings configured");
        }

        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }
}
