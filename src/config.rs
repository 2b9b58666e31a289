use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Default VLAN ports when none are configured.
pub const DEFAULT_PORTS: &str = "9999,9998";
/// Default PID file for daemon mode.
pub const DEFAULT_PID_FILE: &str = "/tmp/vswitch.pid";

/// Resolved runtime configuration, assembled from CLI flags and their
/// `VSWITCH_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// One isolated VLAN per port.
    pub ports: Vec<u16>,
    /// Statistics HTTP port; 0 disables the endpoint.
    pub stats_port: u16,
    pub daemon: bool,
    pub pid_file: PathBuf,
    pub log_file: Option<PathBuf>,
}

/// Parse a comma-separated port list. Each element must be an integer in
/// 1..=65535; blank elements are skipped, an empty result is an error.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    if spec.trim().is_empty() {
        bail!("empty port string");
    }

    let mut ports = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let port: u32 = part
            .parse()
            .with_context(|| format!("invalid port '{}'", part))?;
        if port < 1 || port > 65535 {
            bail!("port {} out of range (1-65535)", port);
        }
        ports.push(port as u16);
    }

    if ports.is_empty() {
        bail!("no ports specified");
    }
    Ok(ports)
}
