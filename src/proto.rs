//! gRPC protocol definitions for agent-operator communication
//!
//! This module contains the generated Protobuf and gRPC code for the
//! event-reporting protocol between node agents and the operator.
//!
//! # Protocol Overview
//!
//! Agents (running on every cluster node) send `WolEvent` messages for each
//! freshly captured Wake-on-LAN packet, either as unary calls or over a
//! bidirectional stream. The operator answers every event with a
//! `WolEventResponse` carrying the outcome (`VM_START_INITIATED`,
//! `VM_NOT_FOUND`, `DUPLICATE`, `ERROR`) and the resolved VM identity where
//! one exists.
//!
//! # Example
//!
//! ```ignore
//! use wakevirt::proto::wol_service_client::WolServiceClient;
//!
//! let mut client = WolServiceClient::connect("http://operator:9090").await?;
//! let response = client.report_wol_event(event).await?.into_inner();
//! match response.status() {
//!     ResponseStatus::VmStartInitiated => { /* woke it up */ }
//!     ResponseStatus::Duplicate => { /* another node got there first */ }
//!     _ => {}
//! }
//! ```

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated protobuf and gRPC code for agent-operator communication
pub mod wol {
    /// Version 1 of the WoL event protocol
    pub mod v1 {
        tonic::include_proto!("wakevirt.wol.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use wol::v1::*;
