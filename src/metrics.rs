use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-VLAN forwarding counters.
///
/// Updated from many reader tasks; every counter is individually monotonic.
/// `total_frames` always equals `broadcast_frames + unicast_frames` at a
/// quiescent moment.
#[derive(Debug, Default)]
pub struct SwitchMetrics {
    pub total_frames: AtomicU64,
    pub broadcast_frames: AtomicU64,
    pub unicast_frames: AtomicU64,
    pub dropped_frames: AtomicU64,
}

impl SwitchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total(&self) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast(&self) {
        self.broadcast_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unicast(&self) {
        self.unicast_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, connections: usize, mac_entries: usize) -> VlanStats {
        VlanStats {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            broadcast_frames: self.broadcast_frames.load(Ordering::Relaxed),
            unicast_frames: self.unicast_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            connections,
            mac_entries,
        }
    }
}

/// Point-in-time statistics for one VLAN.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VlanStats {
    pub total_frames: u64,
    pub broadcast_frames: u64,
    pub unicast_frames: u64,
    pub dropped_frames: u64,
    pub connections: usize,
    pub mac_entries: usize,
}

/// Statistics aggregated across every VLAN, with per-VLAN detail under
/// `"vlan_<port>"` keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub total_frames: u64,
    pub broadcast_frames: u64,
    pub unicast_frames: u64,
    pub dropped_frames: u64,
    pub total_connections: usize,
    pub total_mac_entries: usize,
    pub vlan_count: usize,
    pub vlans: BTreeMap<String, VlanStats>,
}

impl AggregateStats {
    pub fn add_vlan(&mut self, port: u16, stats: VlanStats) {
        self.total_frames += stats.total_frames;
        self.broadcast_frames += stats.broadcast_frames;
        self.unicast_frames += stats.unicast_frames;
        self.dropped_frames += stats.dropped_frames;
        self.total_connections += stats.connections;
        self.total_mac_entries += stats.mac_entries;
        self.vlan_count += 1;
        self.vlans.insert(format!("vlan_{}", port), stats);
    }
}
