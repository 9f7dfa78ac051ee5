//! The authoritative table of known probes and the selected reference
//! instrument.
//!
//! Shared state is limited to this table and the open port handles owned
//! by the transport registry. Updates replace an entry wholesale by port
//! identity, never field-by-field, so a reader always observes an
//! internally consistent record. Lock hold times are brief; no exchange
//! ever runs under the registry lock.

use crate::device::{CalConstants, Mirror, PollUpdate, Probe, ProbeSnapshot};
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-wide device state, constructed empty and passed by `Arc`.
#[derive(Default)]
pub struct DeviceRegistry {
    probes: RwLock<HashMap<String, Probe>>,
    mirror: RwLock<Option<Mirror>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the probe on `port` from a fresh discovery
    /// snapshot. Raw poll data is cleared (it belongs to the previous
    /// record); backfilled constants survive, they live on the device.
    pub async fn upsert_snapshot(&self, port: &str, snapshot: ProbeSnapshot) {
        let mut probes = self.probes.write().await;
        let constants = probes.get(port).and_then(|p| p.constants);
        let mut probe = Probe::from_snapshot(port, snapshot);
        probe.constants = constants;
        debug!(
            "registry: {} probe on '{port}' (address {})",
            if probes.contains_key(port) { "replaced" } else { "added" },
            probe.snapshot.address
        );
        probes.insert(port.to_string(), probe);
    }

    /// Replace the raw section of the probe on `port` with a fresh poll
    /// update. The whole `raw` block comes from this update; nothing is
    /// merged from earlier cycles.
    pub async fn apply_poll(&self, port: &str, update: PollUpdate) {
        let mut probes = self.probes.write().await;
        if let Some(probe) = probes.get_mut(port) {
            probe.raw = Some(update);
            probe.snapshot.temperature.value = update.corrected_temperature;
            probe.snapshot.humidity.value = update.corrected_humidity;
            probe.last_seen = Utc::now();
        }
    }

    /// Record the constants read back from the probe on `port`.
    pub async fn set_constants(&self, port: &str, constants: CalConstants) {
        if let Some(probe) = self.probes.write().await.get_mut(port) {
            probe.constants = Some(constants);
        }
    }

    pub async fn probe(&self, port: &str) -> Option<Probe> {
        self.probes.read().await.get(port).cloned()
    }

    pub async fn contains(&self, port: &str) -> bool {
        self.probes.read().await.contains_key(port)
    }

    /// Consistent snapshot of every known probe, ordered by port name.
    pub async fn snapshot(&self) -> Vec<Probe> {
        let probes = self.probes.read().await;
        let mut all: Vec<Probe> = probes.values().cloned().collect();
        all.sort_by(|a, b| a.port.cmp(&b.port));
        all
    }

    pub async fn is_empty(&self) -> bool {
        self.probes.read().await.is_empty()
    }

    /// Hand off the latest reference-instrument snapshot. The acquisition
    /// path is external; the core only reads this.
    pub async fn set_mirror(&self, mirror: Mirror) {
        *self.mirror.write().await = Some(mirror);
    }

    pub async fn mirror(&self) -> Option<Mirror> {
        self.mirror.read().await.clone()
    }
}
