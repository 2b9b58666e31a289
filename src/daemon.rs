use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use log::warn;

/// Environment marker set on the re-spawned child so it knows it is the
/// daemon (its own `--daemon` flag is stripped to prevent recursion).
pub const DAEMONIZED_ENV: &str = "VSWITCH_DAEMONIZED";

/// Handles daemonization, PID-file management and daemon control.
pub struct DaemonManager {
    pid_file: PathBuf,
    log_file: Option<PathBuf>,
}

impl DaemonManager {
    pub fn new(pid_file: PathBuf, log_file: Option<PathBuf>) -> Self {
        Self { pid_file, log_file }
    }

    /// Re-spawn the current executable in the background without the daemon
    /// flag and record its PID. Fails if a daemon is already running.
    pub fn daemonize(&self) -> Result<u32> {
        if self.is_running() {
            bail!("daemon already running (PID file: {})", self.pid_file.display());
        }

        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        let args: Vec<String> = std::env::args()
            .skip(1)
            .filter(|arg| arg != "--daemon" && !arg.starts_with("--daemon="))
            .collect();

        let mut cmd = Command::new(exe);
        cmd.args(&args)
            .env("VSWITCH_DAEMON", "false")
            .env(DAEMONIZED_ENV, "1")
            .stdin(Stdio::null());

        match &self.log_file {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir).context("failed to create log directory")?;
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                let stderr = file.try_clone().context("failed to duplicate log file")?;
                cmd.stdout(file).stderr(stderr);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().context("failed to start daemon process")?;
        let pid = child.id();

        if let Err(e) = self.write_pid_file(pid) {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            return Err(e.context("failed to write PID file"));
        }

        Ok(pid)
    }

    /// Send SIGTERM to the recorded PID and remove the PID file.
    pub fn stop(&self) -> Result<i32> {
        let pid = self.read_pid_file().context("failed to read PID file")?;

        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            bail!(
                "failed to send SIGTERM to process {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }

        self.cleanup();
        Ok(pid)
    }

    /// Whether the recorded PID names a live process (signal-0 probe).
    pub fn is_running(&self) -> bool {
        match self.read_pid_file() {
            Ok(pid) => unsafe { libc::kill(pid, 0) == 0 },
            Err(_) => false,
        }
    }

    /// The recorded daemon PID, if a PID file exists and parses.
    pub fn pid(&self) -> Option<i32> {
        self.read_pid_file().ok()
    }

    /// Remove the PID file; failures are logged, not fatal.
    pub fn cleanup(&self) {
        if let Err(e) = fs::remove_file(&self.pid_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove PID file: {}", e);
            }
        }
    }

    fn write_pid_file(&self, pid: u32) -> Result<()> {
        if let Some(dir) = self.pid_file.parent() {
            fs::create_dir_all(dir)?;
        }
        // Single decimal PID, newline-terminated.
        fs::write(&self.pid_file, format!("{}\n", pid))?;
        Ok(())
    }

    fn read_pid_file(&self) -> Result<i32> {
        let data = fs::read_to_string(&self.pid_file)?;
        let pid = data
            .trim()
            .parse()
            .with_context(|| format!("invalid PID file contents: {:?}", data))?;
        Ok(pid)
    }
}
