pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod frame;
pub mod http;
pub mod mac_table;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod switch;

// Re-export key types for easier access by consumers
pub use config::{parse_ports, Config};
pub use connection::Connection;
pub use daemon::DaemonManager;
pub use error::SwitchError;
pub use frame::{EthernetFrame, MacAddr, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
pub use mac_table::{MacEntry, MacTable};
pub use manager::SwitchManager;
pub use metrics::{AggregateStats, SwitchMetrics, VlanStats};
pub use pool::{BufferPool, PooledBuf};
pub use switch::{VirtualSwitch, DEFAULT_MAC_TIMEOUT, MAC_AGING_INTERVAL};
