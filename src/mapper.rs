//! MAC address to VirtualMachine mapping table
//!
//! The table is written by the controller (a whole-snapshot install on every
//! reconcile) and read by the aggregator on every reported event. Readers
//! must never observe a half-constructed table, so the swap happens under a
//! single write lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Identity of a VirtualMachine bound to a MAC address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmBinding {
    /// Name of the VirtualMachine
    pub name: String,
    /// Namespace where the VM resides
    pub namespace: String,
}

/// Converts a MAC address to its canonical map-key form: trimmed, lowercase.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

#[derive(Default)]
struct TableState {
    mapping: HashMap<String, VmBinding>,
    last_sync: Option<DateTime<Utc>>,
}

/// The shared MAC to VM lookup table.
///
/// Reader-heavy: the aggregator takes a read lock per lookup, the controller
/// replaces the whole table atomically after each mapping rebuild.
#[derive(Default)]
pub struct MacMapper {
    inner: RwLock<TableState>,
}

impl MacMapper {
    /// Creates an empty mapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the VM bound to the given MAC address.
    pub fn lookup(&self, mac: &str) -> Option<VmBinding> {
        let key = normalize_mac(mac);
        self.inner.read().mapping.get(&key).cloned()
    }

    /// Atomically replaces the table with a freshly built snapshot.
    ///
    /// Keys are expected to already be in canonical form (see
    /// [`normalize_mac`]).
    pub fn install(&self, mapping: HashMap<String, VmBinding>) {
        let mut state = self.inner.write();
        state.mapping = mapping;
        state.last_sync = Some(Utc::now());
    }

    /// Number of MAC addresses currently mapped.
    pub fn len(&self) -> usize {
        self.inner.read().mapping.len()
    }

    /// True if no MAC is currently mapped.
    pub fn is_empty(&self) -> bool {
        self.inner.read().mapping.is_empty()
    }

    /// Timestamp of the last snapshot install, if any.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_sync
    }
}
