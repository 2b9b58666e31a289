use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::Mutex;

use crate::error::SwitchError;
use crate::metrics::AggregateStats;
use crate::pool::BufferPool;
use crate::switch::{VirtualSwitch, DEFAULT_MAC_TIMEOUT};

/// Registry of isolated VLANs, keyed by listening port.
///
/// Owns the shared frame-buffer pool and the switches themselves; stopping
/// keeps the registry populated so statistics remain readable afterwards.
pub struct SwitchManager {
    switches: Mutex<HashMap<u16, Arc<VirtualSwitch>>>,
    pool: Arc<BufferPool>,
    mac_timeout: Duration,
}

impl SwitchManager {
    pub fn new() -> Arc<Self> {
        Self::with_mac_timeout(DEFAULT_MAC_TIMEOUT)
    }

    pub fn with_mac_timeout(mac_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            switches: Mutex::new(HashMap::new()),
            pool: BufferPool::new(),
            mac_timeout,
        })
    }

    /// Register a new VLAN on `port`. One VLAN per port.
    pub async fn add_vlan(&self, port: u16) -> Result<(), SwitchError> {
        let mut switches = self.switches.lock().await;
        if switches.contains_key(&port) {
            return Err(SwitchError::DuplicateVlan(port));
        }
        let switch = VirtualSwitch::with_mac_timeout(port, Arc::clone(&self.pool), self.mac_timeout);
        switches.insert(port, switch);
        info!("Created VLAN on port {}", port);
        Ok(())
    }

    /// Stop and unregister the VLAN on `port`.
    pub async fn remove_vlan(&self, port: u16) -> Result<(), SwitchError> {
        let switch = self
            .switches
            .lock()
            .await
            .remove(&port)
            .ok_or(SwitchError::UnknownVlan(port))?;
        switch.stop().await;
        info!("Removed VLAN on port {}", port);
        Ok(())
    }

    /// Start every registered VLAN. A port that fails to bind is logged and
    /// skipped; the others come up regardless. Returns how many started.
    pub async fn start_all(&self) -> usize {
        let switches: Vec<Arc<VirtualSwitch>> =
            self.switches.lock().await.values().cloned().collect();

        let mut started = 0;
        for switch in switches {
            match switch.start().await {
                Ok(()) => {
                    info!("Started VLAN on port {}", switch.vlan_port());
                    started += 1;
                }
                Err(e) => error!("{}", e),
            }
        }
        started
    }

    /// Stop every VLAN. Idempotent; the registry stays populated.
    pub async fn stop_all(&self) {
        let switches: Vec<Arc<VirtualSwitch>> =
            self.switches.lock().await.values().cloned().collect();

        for switch in switches {
            switch.stop().await;
            info!("Stopped VLAN on port {}", switch.vlan_port());
        }
    }

    /// Ports with a registered VLAN, ascending.
    pub async fn vlans(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.switches.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub async fn vlan(&self, port: u16) -> Option<Arc<VirtualSwitch>> {
        self.switches.lock().await.get(&port).cloned()
    }

    /// Counters summed across all VLANs, with per-VLAN detail.
    pub async fn stats(&self) -> AggregateStats {
        let switches: Vec<(u16, Arc<VirtualSwitch>)> = self
            .switches
            .lock()
            .await
            .iter()
            .map(|(port, sw)| (*port, Arc::clone(sw)))
            .collect();

        let mut aggregate = AggregateStats::default();
        for (port, switch) in switches {
            aggregate.add_vlan(port, switch.stats());
        }
        aggregate
    }
}
