//! Managed Process - a bot script spawned by the supervisor
//!
//! The child's stdout and stderr are redirected straight into the key's
//! append-mode log file, so output lines and lifecycle markers share one
//! file without truncation. A background waiter owns the `Child`, reaps it,
//! appends an exit marker and flips the running watch to `false`.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::watch;

use super::log_router::LogSink;

/// Snapshot of one registry entry, as reported by `list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotStatus {
    pub key: String,
    pub pid: u32,
    /// Unix timestamp (seconds)
    pub started_at: u64,
    /// False once the waiter has seen the child exit on its own
    pub alive: bool,
}

/// A bot process owned by the process registry.
pub struct ManagedProcess {
    pub key: String,
    pub pid: u32,
    pub started_at: u64,
    running_rx: watch::Receiver<bool>,
}

impl ManagedProcess {
    /// Spawn `<interpreter> -u <script>` in `working_dir` with both output
    /// streams appended to `sink`.
    pub fn spawn(
        key: &str,
        interpreter: &str,
        script: &Path,
        working_dir: &Path,
        sink: &LogSink,
    ) -> Result<Self> {
        let log = sink.open_append()?;
        let log_err = log
            .try_clone()
            .context("Failed to duplicate log file handle")?;

        let mut cmd = Command::new(interpreter);
        cmd.arg("-u")
            .arg(script)
            .current_dir(working_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);

        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{} {}'", interpreter, script.display()))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned process"))?;

        let (running_tx, running_rx) = watch::channel(true);

        // ── process waiter ───────────────────────────────────
        {
            let key = key.to_string();
            let sink = sink.clone();
            tokio::spawn(async move {
                let exit_msg = match child.wait().await {
                    Ok(status) => format!("Process exited with {}", status),
                    Err(e) => format!("Failed to wait for process: {}", e),
                };
                tracing::info!("Bot '{}' (pid {}): {}", key, pid, exit_msg);
                if let Err(e) = sink.append_marker(&exit_msg) {
                    tracing::warn!("Could not write exit marker for '{}': {:#}", key, e);
                }
                let _ = running_tx.send(false);
            });
        }

        Ok(Self {
            key: key.to_string(),
            pid,
            started_at: current_timestamp(),
            running_rx,
        })
    }

    /// Whether the child is still alive.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    pub fn status(&self) -> BotStatus {
        BotStatus {
            key: self.key.clone(),
            pid: self.pid,
            started_at: self.started_at,
            alive: self.is_running(),
        }
    }

    /// Wait up to `timeout` for the child to exit. Returns true if it did.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.running_rx.clone();
        let exited = async move {
            while *rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, exited).await.is_ok()
    }

    /// Send a termination request to the child.
    /// `force = false` asks it to exit, `force = true` kills it outright.
    pub fn terminate(&self, force: bool) -> Result<()> {
        let signal_name = if force { "KILL" } else { "TERM" };
        tracing::info!("Sending {} to bot '{}' (pid: {})", signal_name, self.key, self.pid);
        send_termination(self.pid, force)
    }
}

#[cfg(not(target_os = "windows"))]
fn send_termination(pid: u32, force: bool) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match signal::kill(Pid::from_raw(pid as i32), signal) {
        // already gone between the liveness check and the signal
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Failed to send {:?} to pid {}: {}", signal, pid, e)),
    }
}

#[cfg(target_os = "windows")]
fn send_termination(pid: u32, force: bool) -> Result<()> {
    if !force {
        // taskkill without /F posts a close request
        let mut cmd = std::process::Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string()]);
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(crate::utils::CREATE_NO_WINDOW);
        }
        cmd.output()
            .map_err(|e| anyhow::anyhow!("Failed to run taskkill for PID {}: {}", pid, e))?;
        return Ok(());
    }

    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            // process already exited
            return Ok(());
        }
        let result = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if result == 0 {
            return Err(anyhow::anyhow!("TerminateProcess failed for PID {}", pid));
        }
    }
    Ok(())
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
