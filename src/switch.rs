use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::connection::Connection;
use crate::error::SwitchError;
use crate::frame::EthernetFrame;
use crate::mac_table::MacTable;
use crate::metrics::{SwitchMetrics, VlanStats};
use crate::pool::BufferPool;

/// How often the aging worker sweeps the MAC table.
pub const MAC_AGING_INTERVAL: Duration = Duration::from_secs(30);
/// Entries older than this are dropped by the aging sweep.
pub const DEFAULT_MAC_TIMEOUT: Duration = Duration::from_secs(300);

/// One isolated VLAN: a listening port, its attached connections and its MAC
/// learning table.
///
/// Runs three kinds of workers: an acceptor, one reader per connection, and
/// an aging sweeper. All of them observe shutdown through a watch channel
/// selected against their blocking point, so `stop` wakes every task
/// immediately and leaves none running.
pub struct VirtualSwitch {
    port: u16,
    mac_timeout: Duration,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    mac_table: MacTable,
    metrics: SwitchMetrics,
    pool: Arc<BufferPool>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    bound_port: AtomicU16,
}

impl VirtualSwitch {
    pub fn new(port: u16, pool: Arc<BufferPool>) -> Arc<Self> {
        Self::with_mac_timeout(port, pool, DEFAULT_MAC_TIMEOUT)
    }

    pub fn with_mac_timeout(port: u16, pool: Arc<BufferPool>, mac_timeout: Duration) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            port,
            mac_timeout,
            connections: RwLock::new(HashMap::new()),
            mac_table: MacTable::new(),
            metrics: SwitchMetrics::new(),
            pool,
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
            bound_port: AtomicU16::new(0),
        })
    }

    /// Bind the listening socket and spawn the acceptor and aging workers.
    pub async fn start(self: &Arc<Self>) -> Result<(), SwitchError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| SwitchError::BindFailed {
                port: self.port,
                source: e,
            })?;
        let local = listener.local_addr()?;
        self.bound_port.store(local.port(), Ordering::SeqCst);
        info!("VLAN {}: listening on {}", self.vlan_port(), local);

        let mut tasks = self.tasks.lock().await;
        let sw = Arc::clone(self);
        tasks.push(tokio::spawn(async move { sw.accept_loop(listener).await }));
        let sw = Arc::clone(self);
        tasks.push(tokio::spawn(async move { sw.aging_loop().await }));
        Ok(())
    }

    /// Signal shutdown, close every connection and wait for all workers.
    /// Idempotent; statistics stay readable afterwards.
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("VLAN {}: stopping", self.vlan_port());

        let connections: Vec<Arc<Connection>> =
            self.read_connections().values().cloned().collect();
        for conn in connections {
            conn.close().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        info!("VLAN {}: stopped", self.vlan_port());
    }

    /// The configured port, or the actually bound port when configured as 0.
    pub fn vlan_port(&self) -> u16 {
        let bound = self.bound_port.load(Ordering::SeqCst);
        if self.port != 0 {
            self.port
        } else {
            bound
        }
    }

    /// The port the listener is bound to; 0 until `start` succeeds.
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    pub fn mac_table(&self) -> &MacTable {
        &self.mac_table
    }

    pub fn connection_count(&self) -> usize {
        self.read_connections().len()
    }

    pub fn stats(&self) -> VlanStats {
        self.metrics
            .snapshot(self.connection_count(), self.mac_table.len())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let id = format!("{}-{}", addr, self.vlan_port());
                        let conn = Connection::new(id, addr.to_string(), stream);
                        self.write_connections()
                            .insert(conn.id().to_string(), Arc::clone(&conn));
                        info!("VLAN {}: new connection {}", self.vlan_port(), conn);

                        let sw = Arc::clone(&self);
                        let reader = tokio::spawn(async move { sw.reader_loop(conn).await });
                        self.tasks.lock().await.push(reader);
                    }
                    Err(e) => {
                        error!("VLAN {}: accept error: {}", self.vlan_port(), e);
                    }
                },
            }
        }
    }

    async fn reader_loop(self: Arc<Self>, conn: Arc<Connection>) {
        // Subscribing may happen after shutdown was signalled (a connection
        // accepted in the same instant), so the current value is checked at
        // every loop top, not just awaited.
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                read = conn.read_frame(&self.pool) => match read {
                    Ok(frame) => self.process_frame(&frame, &conn).await,
                    Err(SwitchError::ConnectionClosed) => break,
                    Err(e) if e.is_protocol_violation() => {
                        warn!(
                            "VLAN {}: connection {} protocol error: {}",
                            self.vlan_port(),
                            conn.id(),
                            e
                        );
                        self.metrics.inc_dropped();
                        break;
                    }
                    Err(e) => {
                        debug!(
                            "VLAN {}: connection {} read error: {}",
                            self.vlan_port(),
                            conn.id(),
                            e
                        );
                        break;
                    }
                },
            }
        }
        self.cleanup_connection(&conn).await;
    }

    /// Forwarding plane, invoked once per received frame.
    async fn process_frame(&self, frame: &EthernetFrame, source: &Arc<Connection>) {
        self.metrics.inc_total();
        self.mac_table.learn(frame.src_mac(), source);

        let write_errors = if frame.is_broadcast() || frame.is_multicast() {
            self.metrics.inc_broadcast();
            self.flood(frame, source).await
        } else {
            self.metrics.inc_unicast();
            self.forward(frame, source).await
        };
        if write_errors > 0 {
            self.metrics.inc_dropped();
        }
    }

    /// Deliver a unicast frame. Returns the number of failed writes.
    async fn forward(&self, frame: &EthernetFrame, source: &Arc<Connection>) -> usize {
        let dst = frame.dst_mac();
        match self.mac_table.lookup(&dst) {
            // Hair-pinning is disallowed: a VM never sees its own frames.
            Some(entry) if entry.connection.id() == source.id() => 0,
            Some(entry) if !entry.connection.is_closed() => {
                match entry.connection.write_frame(frame).await {
                    Ok(()) => {
                        debug!(
                            "VLAN {}: forwarded {} -> {} via {}",
                            self.vlan_port(),
                            frame.src_mac(),
                            dst,
                            entry.connection.id()
                        );
                        0
                    }
                    Err(e) => {
                        warn!(
                            "VLAN {}: failed to forward frame to {}: {}",
                            self.vlan_port(),
                            entry.connection.id(),
                            e
                        );
                        1
                    }
                }
            }
            // Unknown destination, or the entry points at a dead connection.
            _ => {
                debug!(
                    "VLAN {}: unknown destination {}, flooding",
                    self.vlan_port(),
                    dst
                );
                self.flood(frame, source).await
            }
        }
    }

    /// Write the frame to every open connection except the source. Errors
    /// are collected, never aborting the sweep. Returns the failure count.
    async fn flood(&self, frame: &EthernetFrame, source: &Arc<Connection>) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .read_connections()
            .values()
            .filter(|c| c.id() != source.id() && !c.is_closed())
            .cloned()
            .collect();

        let mut errors = 0;
        for conn in targets {
            if let Err(e) = conn.write_frame(frame).await {
                warn!(
                    "VLAN {}: failed to flood frame to {}: {}",
                    self.vlan_port(),
                    conn.id(),
                    e
                );
                errors += 1;
            }
        }
        if errors > 0 {
            warn!(
                "VLAN {}: flooding completed with {} errors",
                self.vlan_port(),
                errors
            );
        }
        errors
    }

    /// Remove a connection from the VLAN: registry first, then its MAC
    /// entries, then the socket. After this the reader task exits.
    async fn cleanup_connection(&self, conn: &Arc<Connection>) {
        debug!(
            "VLAN {}: cleaning up connection {}",
            self.vlan_port(),
            conn.id()
        );
        self.write_connections().remove(conn.id());
        self.mac_table.evict_connection(conn.id());
        conn.close().await;
    }

    async fn aging_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(MAC_AGING_INTERVAL);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let removed = self.mac_table.age(self.mac_timeout);
                    if removed > 0 {
                        info!(
                            "VLAN {}: cleaned up {} stale MAC entries",
                            self.vlan_port(),
                            removed
                        );
                    }
                }
            }
        }
    }

    fn read_connections(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    const SETTLE: Duration = Duration::from_millis(200);
    const RECV_WAIT: Duration = Duration::from_millis(500);

    async fn start_switch() -> (Arc<VirtualSwitch>, u16) {
        let pool = BufferPool::new();
        let sw = VirtualSwitch::new(0, pool);
        sw.start().await.unwrap();
        let port = sw.bound_port();
        (sw, port)
    }

    async fn connect(port: u16) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Give the acceptor a moment to register the connection.
        sleep(SETTLE).await;
        stream
    }

    fn frame_bytes(dst: [u8; 6], src: [u8; 6], total_len: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_len];
        data[0..6].copy_from_slice(&dst);
        data[6..12].copy_from_slice(&src);
        data[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        data
    }

    async fn send(stream: &mut TcpStream, frame: &[u8]) {
        stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(frame).await.unwrap();
        stream.flush().await.unwrap();
        sleep(SETTLE).await;
    }

    /// Receive one frame within `RECV_WAIT`, or None when nothing comes.
    async fn try_recv(stream: &mut TcpStream) -> Option<Vec<u8>> {
        let mut prefix = [0u8; 4];
        match timeout(RECV_WAIT, stream.read_exact(&mut prefix)).await {
            Ok(Ok(_)) => {}
            _ => return None,
        }
        let len = u32::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        match timeout(RECV_WAIT, stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => Some(body),
            _ => None,
        }
    }

    fn mac(last: u8) -> [u8; 6] {
        [0x02, 0, 0, 0, 0, last]
    }

    #[tokio::test]
    async fn scenario_learning_and_unicast() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;

        // VM-1 announces itself with a broadcast; the switch learns its MAC.
        send(&mut vm1, &frame_bytes([0xff; 6], mac(1), 64)).await;

        let mut vm2 = connect(port).await;
        let mut vm3 = connect(port).await;

        send(&mut vm2, &frame_bytes(mac(1), mac(2), 64)).await;

        let delivered = try_recv(&mut vm1).await.expect("VM-1 should receive");
        assert_eq!(delivered, frame_bytes(mac(1), mac(2), 64));
        assert!(try_recv(&mut vm3).await.is_none(), "VM-3 must stay silent");

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_unknown_unicast_floods() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;
        let mut vm2 = connect(port).await;
        let mut vm3 = connect(port).await;

        let frame = frame_bytes(mac(9), mac(2), 64);
        send(&mut vm2, &frame).await;

        assert_eq!(try_recv(&mut vm1).await.unwrap(), frame);
        assert_eq!(try_recv(&mut vm3).await.unwrap(), frame);
        assert!(try_recv(&mut vm2).await.is_none(), "source must not echo");

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_broadcast() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;
        let mut vm2 = connect(port).await;
        let mut vm3 = connect(port).await;

        let frame = frame_bytes([0xff; 6], mac(1), 64);
        send(&mut vm1, &frame).await;

        assert_eq!(try_recv(&mut vm2).await.unwrap(), frame);
        assert_eq!(try_recv(&mut vm3).await.unwrap(), frame);
        assert!(try_recv(&mut vm1).await.is_none());

        let stats = sw.stats();
        assert_eq!(stats.broadcast_frames, 1);
        assert_eq!(stats.total_frames, 1);

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_multicast_is_flooded() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;
        let mut vm2 = connect(port).await;

        // IPv4 multicast group MAC.
        let frame = frame_bytes([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01], mac(1), 64);
        send(&mut vm1, &frame).await;

        assert_eq!(try_recv(&mut vm2).await.unwrap(), frame);
        assert_eq!(sw.stats().broadcast_frames, 1);

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_mac_mobility() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;
        let mut vm2 = connect(port).await;
        let mut vm3 = connect(port).await;

        // The same MAC speaks first on VM-1, then moves to VM-2.
        send(&mut vm1, &frame_bytes([0xff; 6], mac(7), 64)).await;
        while try_recv(&mut vm2).await.is_some() {}
        while try_recv(&mut vm3).await.is_some() {}
        send(&mut vm2, &frame_bytes([0xff; 6], mac(7), 64)).await;
        while try_recv(&mut vm1).await.is_some() {}
        while try_recv(&mut vm3).await.is_some() {}

        let frame = frame_bytes(mac(7), mac(3), 64);
        send(&mut vm3, &frame).await;

        assert_eq!(try_recv(&mut vm2).await.unwrap(), frame);
        assert!(try_recv(&mut vm1).await.is_none());

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_hairpin_frames_are_dropped_silently() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;
        let mut vm2 = connect(port).await;

        send(&mut vm1, &frame_bytes([0xff; 6], mac(1), 64)).await;
        assert!(try_recv(&mut vm2).await.is_some());

        // Unicast addressed to the sender's own MAC goes nowhere.
        send(&mut vm1, &frame_bytes(mac(1), mac(1), 64)).await;
        assert!(try_recv(&mut vm1).await.is_none());
        assert!(try_recv(&mut vm2).await.is_none());

        let stats = sw.stats();
        assert_eq!(stats.total_frames, 2);
        assert_eq!(stats.dropped_frames, 0);

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_framing_error_tears_down_one_connection() {
        let (sw, port) = start_switch().await;
        let mut bad = connect(port).await;
        let mut vm2 = connect(port).await;
        assert_eq!(sw.connection_count(), 2);

        // Length prefix 2048: over the 1518 cap.
        bad.write_all(&2048u32.to_be_bytes()).await.unwrap();
        bad.flush().await.unwrap();
        sleep(SETTLE).await;

        // The server closes the offending connection...
        let mut probe = [0u8; 1];
        let n = timeout(RECV_WAIT, bad.read(&mut probe))
            .await
            .expect("server should close the bad connection")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(sw.connection_count(), 1);
        assert!(try_recv(&mut vm2).await.is_none(), "nothing was forwarded");

        // ...while the healthy one keeps working.
        let mut vm3 = connect(port).await;
        let frame = frame_bytes([0xff; 6], mac(3), 64);
        send(&mut vm3, &frame).await;
        assert_eq!(try_recv(&mut vm2).await.unwrap(), frame);

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_zero_source_mac_is_dropped_and_counted() {
        let (sw, port) = start_switch().await;
        let mut bad = connect(port).await;
        let mut vm2 = connect(port).await;

        send(&mut bad, &frame_bytes([0xff; 6], [0x00; 6], 64)).await;

        assert!(try_recv(&mut vm2).await.is_none(), "invalid frame forwarded");
        assert_eq!(sw.stats().dropped_frames, 1);
        assert_eq!(sw.connection_count(), 1, "offender must be torn down");

        sw.stop().await;
    }

    #[tokio::test]
    async fn scenario_disconnect_cleans_up_mac_entries() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;
        let _vm2 = connect(port).await;

        send(&mut vm1, &frame_bytes([0xff; 6], mac(1), 64)).await;
        assert_eq!(sw.mac_table().len(), 1);
        assert_eq!(sw.connection_count(), 2);

        drop(vm1);
        sleep(SETTLE).await;

        assert_eq!(sw.mac_table().len(), 0);
        assert_eq!(sw.connection_count(), 1);

        sw.stop().await;
    }

    #[tokio::test]
    async fn aging_forgets_idle_macs() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;

        send(&mut vm1, &frame_bytes([0xff; 6], mac(1), 64)).await;
        assert_eq!(sw.mac_table().len(), 1);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(sw.mac_table().age(Duration::from_millis(10)), 1);
        assert_eq!(sw.mac_table().len(), 0);

        sw.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_connections_and_workers() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;

        sw.stop().await;

        let mut probe = [0u8; 1];
        let n = timeout(RECV_WAIT, vm1.read(&mut probe))
            .await
            .expect("server should close on stop")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(sw.connection_count(), 0);

        // Stop again: must be a no-op.
        sw.stop().await;

        // Stats stay readable after shutdown.
        let _ = sw.stats();
    }

    #[tokio::test]
    async fn frames_keep_arrival_order_per_destination() {
        let (sw, port) = start_switch().await;
        let mut vm1 = connect(port).await;
        let mut vm2 = connect(port).await;

        send(&mut vm1, &frame_bytes([0xff; 6], mac(1), 64)).await;
        while try_recv(&mut vm2).await.is_some() {}

        for i in 1..=5u8 {
            let frame = frame_bytes(mac(1), mac(2), 60 + i as usize);
            vm2.write_all(&(frame.len() as u32).to_be_bytes())
                .await
                .unwrap();
            vm2.write_all(&frame).await.unwrap();
        }
        vm2.flush().await.unwrap();
        sleep(SETTLE).await;

        for i in 1..=5u8 {
            let got = try_recv(&mut vm1).await.expect("in-order delivery");
            assert_eq!(got.len(), 60 + i as usize);
        }

        sw.stop().await;
    }
}
