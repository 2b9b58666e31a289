use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time::interval;

use vswitch::daemon::{DaemonManager, DAEMONIZED_ENV};
use vswitch::http::serve_stats;
use vswitch::manager::SwitchManager;
use vswitch::{config, parse_ports, Config};

/// How often the aggregate statistics line is logged.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "vswitch",
    version,
    about = "Virtual Ethernet switch for QEMU VMs",
    long_about = "A virtual Ethernet switch with isolated VLANs.\n\
        Each listening port creates a separate isolated virtual LAN: VMs \n\
        attached to the same port share a broadcast domain, VMs on different \n\
        ports cannot see each other's traffic.\n\n\
        Examples:\n  \
          vswitch --ports 9999,9998\n  \
          vswitch --daemon --ports 8080,8081\n  \
          vswitch --stop\n  \
          vswitch --status"
)]
struct Args {
    /// Comma-separated list of ports (each port = isolated VLAN)
    #[arg(long, default_value = config::DEFAULT_PORTS, env = "VSWITCH_PORTS")]
    ports: String,

    /// Port for the statistics HTTP server (0 to disable)
    #[arg(long, default_value_t = 0, env = "VSWITCH_STATS_PORT")]
    stats_port: u16,

    /// Run as daemon in background
    #[arg(long, env = "VSWITCH_DAEMON")]
    daemon: bool,

    /// PID file for daemon mode
    #[arg(long, default_value = config::DEFAULT_PID_FILE, env = "VSWITCH_PID_FILE")]
    pid_file: PathBuf,

    /// Log file (stderr when unset)
    #[arg(long, env = "VSWITCH_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Stop a running daemon
    #[arg(long)]
    stop: bool,

    /// Show daemon status
    #[arg(long)]
    status: bool,
}

impl Args {
    /// Resolve the parsed flags (and their env overrides) into the runtime
    /// configuration. Port validation happens here.
    fn into_config(self) -> Result<Config> {
        Ok(Config {
            ports: parse_ports(&self.ports).context("invalid ports specification")?,
            stats_port: self.stats_port,
            daemon: self.daemon,
            pid_file: self.pid_file,
            log_file: self.log_file,
        })
    }
}

fn setup_logging(log_file: Option<&std::path::Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn spawn_stats_logger(manager: Arc<SwitchManager>) {
    tokio::spawn(async move {
        let mut ticker = interval(STATS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = manager.stats().await;
            info!(
                "Stats: {} VLANs, {} total connections, {} MAC entries, {} total frames ({} unicast, {} broadcast, {} dropped)",
                stats.vlan_count,
                stats.total_connections,
                stats.total_mac_entries,
                stats.total_frames,
                stats.unicast_frames,
                stats.broadcast_frames,
                stats.dropped_frames,
            );
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let dm = DaemonManager::new(args.pid_file.clone(), args.log_file.clone());

    // Daemon control commands run and exit before anything is started.
    if args.stop {
        let pid = dm.stop()?;
        println!("Daemon stopped (PID: {})", pid);
        return Ok(());
    }

    if args.status {
        if dm.is_running() {
            println!(
                "Daemon is running (PID: {})",
                dm.pid().unwrap_or(-1)
            );
        } else {
            println!("Daemon is not running");
        }
        return Ok(());
    }

    let config = args.into_config()?;

    if config.daemon {
        let pid = dm.daemonize()?;
        println!("Daemon started (PID: {})", pid);
        return Ok(());
    }

    // Set when this process is the re-spawned daemon child.
    let is_daemon = std::env::var_os(DAEMONIZED_ENV).is_some();

    setup_logging(config.log_file.as_deref())?;
    info!("Starting virtual switch v{}", env!("CARGO_PKG_VERSION"));
    info!("Configured VLANs on ports: {:?}", config.ports);

    let manager = SwitchManager::new();
    for port in &config.ports {
        manager
            .add_vlan(*port)
            .await
            .with_context(|| format!("failed to create VLAN on port {}", port))?;
    }

    let started = manager.start_all().await;
    if started == 0 {
        anyhow::bail!("no VLAN could be started");
    }

    if config.stats_port > 0 {
        let stats_manager = Arc::clone(&manager);
        let stats_port = config.stats_port;
        tokio::spawn(async move {
            if let Err(e) = serve_stats(stats_manager, stats_port).await {
                error!("Statistics server failed: {}", e);
            }
        });
    }

    spawn_stats_logger(Arc::clone(&manager));

    info!(
        "Virtual switch started with {} isolated VLANs. Press Ctrl+C to stop.",
        started
    );

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    manager.stop_all().await;

    if is_daemon {
        dm.cleanup();
    }

    info!("Virtual switch stopped");
    Ok(())
}
