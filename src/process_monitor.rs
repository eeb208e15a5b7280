//! OS process table scan used at startup to spot bots left running by a
//! previous daemon. The registry is in-memory only, so such processes are
//! reported and never touched.

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    /// Full command line, e.g. ["python3", "-u", "/srv/git_bots/bots/bot.py"]
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// Every process visible to this user.
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new_all();
    sys.refresh_all();

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            cmd: process.cmd().to_vec(),
        })
        .collect();

    tracing::debug!("Found {} running processes", processes.len());
    processes
}

/// Processes other than this one whose command line mentions `needle`.
pub fn find_by_cmd(processes: Vec<RunningProcess>, needle: &str) -> Vec<RunningProcess> {
    let own_pid = std::process::id();
    processes
        .into_iter()
        .filter(|p| p.pid != own_pid)
        .filter(|p| p.cmd.iter().any(|arg| arg.contains(needle)))
        .collect()
}

/// Bots still running from `base_dir`. Bots are spawned with an absolute
/// script path, so the canonical base directory identifies them.
pub fn find_orphans(base_dir: &Path) -> Vec<RunningProcess> {
    let Ok(base) = std::fs::canonicalize(base_dir) else {
        return Vec::new();
    };
    find_by_cmd(get_running_processes(), &base.to_string_lossy())
}

/// `find_orphans` on the blocking pool; the process table scan is synchronous.
pub async fn find_orphans_async(base_dir: &Path) -> Vec<RunningProcess> {
    let base_dir = base_dir.to_path_buf();
    tokio::task::spawn_blocking(move || find_orphans(&base_dir))
        .await
        .unwrap_or_default()
}
