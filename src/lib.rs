//! wakevirt - Wake-on-LAN operator for KubeVirt clusters
//!
//! wakevirt wakes VirtualMachines hosted on a Kubernetes cluster in response
//! to Wake-on-LAN magic packets arriving on the physical or overlay networks
//! of cluster nodes.
//!
//! # Architecture
//!
//! Two cooperating processes, both built from this crate:
//!
//! - The **node agent** (one per node, deployed as a DaemonSet) captures WoL
//!   packets on every configured UDP port and, where `NET_RAW` is available,
//!   as raw EtherType `0x0842` Ethernet frames. Captured packets are
//!   deduplicated locally and shipped to the operator over gRPC.
//! - The **operator** (singleton) terminates the gRPC channel, deduplicates
//!   globally, resolves the MAC address to a VirtualMachine through an
//!   in-memory mapping table, and initiates the VM start. It also reconciles
//!   the cluster-scoped `WolConfig` resource into the mapping table and one
//!   agent DaemonSet per configuration.
//!
//! # Modules
//!
//! - [`packet`] - Magic packet decoding
//! - [`agent`] - Per-node capture agent (UDP + raw L2)
//! - [`aggregator`] - gRPC server: global dedupe, MAC lookup, VM start
//! - [`controller`] - WolConfig reconciliation (mapping + agent fleets)
//! - [`crd`] - The WolConfig custom resource
//! - [`mapper`] - The MAC to VM mapping table
//! - [`discovery`] - VirtualMachine discovery behind a narrow interface
//! - [`starter`] - VM start with run-strategy restore handling
//! - [`metrics`] - Prometheus counters and gauges
//! - [`probes`] - Operator health probes and metrics exposition
//! - [`proto`] - Generated gRPC protocol definitions
//! - [`error`] - Error types

pub mod agent;
pub mod aggregator;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod mapper;
pub mod metrics;
pub mod packet;
pub mod probes;
pub mod proto;
pub mod starter;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// The standard Wake-on-LAN UDP port
pub const DEFAULT_WOL_PORT: u16 = 9;

/// Default port for the operator gRPC server (agent event reporting)
pub const DEFAULT_GRPC_PORT: u16 = 9090;

/// Default port for the agent health/metrics HTTP server
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Default mapping refresh period in seconds when `cacheTTL` is unset
pub const DEFAULT_CACHE_TTL_SECS: i32 = 300;

/// Maximum gRPC message size in either direction
pub const MAX_RPC_MESSAGE_BYTES: usize = 1024 * 1024;
