pub mod error;
pub mod log_router;
pub mod managed_process;
pub mod registry;

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::GlobalConfig;
use crate::repository::{Provisioner, RepositoryState};
use error::SupervisorError;
use log_router::LogRouter;
use managed_process::{BotStatus, ManagedProcess};
use registry::ProcessRegistry;

/// How long to wait for the kernel to reap a child after a forced kill
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

const STARTING_MARKER: &str = "Starting bot...";
const STOPPED_MARKER: &str = "Bot stopped";
const START_FAILED_MARKER: &str = "Failed to start bot";

/// Result of a successful `start`/`restart`
#[derive(Debug, Clone, Serialize)]
pub struct StartedBot {
    pub key: String,
    pub pid: u32,
    pub log_path: PathBuf,
}

/// Registry and router share one lock so a key's stop always completes
/// before its replacement is spawned.
struct ProcessState {
    registry: ProcessRegistry,
    logs: LogRouter,
}

/// Owns the active repository, the running bots and their log sinks.
///
/// Lock order: `processes` before `repository`. Provisioning only takes
/// `repository`.
pub struct Supervisor {
    provisioner: Provisioner,
    interpreter: String,
    grace_period: Duration,
    log_tail_chars: usize,
    seed_repo_url: Option<String>,
    repository: RwLock<Option<RepositoryState>>,
    processes: Mutex<ProcessState>,
}

impl Supervisor {
    pub fn new(config: &GlobalConfig) -> Self {
        Self {
            provisioner: Provisioner::new(&config.base_dir, &config.git, &config.interpreter),
            interpreter: config.interpreter.clone(),
            grace_period: config.grace_period(),
            log_tail_chars: config.log_tail_chars,
            seed_repo_url: config.repo_url.clone(),
            repository: RwLock::new(None),
            processes: Mutex::new(ProcessState {
                registry: ProcessRegistry::new(),
                logs: LogRouter::new(&config.logs_dir),
            }),
        }
    }

    /// Restore the repository recorded by a previous run, or seed it from
    /// the configured `repo_url`. Nothing is cloned here.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let restored = match self.provisioner.load_state()? {
            Some(repo) => Some(repo),
            None => match &self.seed_repo_url {
                Some(url) => Some(self.provisioner.resolve(url)?),
                None => None,
            },
        };
        match &restored {
            Some(repo) => tracing::info!(
                "Active repository: {} ({})",
                repo.url,
                repo.local_dir.display()
            ),
            None => tracing::info!("No repository configured yet"),
        }
        *self.repository.write().await = restored;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        self.provisioner.base_dir()
    }

    pub async fn repository(&self) -> Option<RepositoryState> {
        self.repository.read().await.clone()
    }

    /// Clone or pull `url`, record it as the active repository and install
    /// its requirements.
    ///
    /// A failed clone/pull leaves the previous repository active. A failed
    /// install still records the new repository, since its sources are on disk.
    pub async fn provision(&self, url: &str) -> Result<RepositoryState, SupervisorError> {
        let repo = self.provisioner.resolve(url)?;
        let mut active = self.repository.write().await;

        self.provisioner.fetch(&repo).await?;

        if let Err(e) = self.provisioner.save_state(&repo) {
            tracing::warn!("Could not persist repository state: {:#}", e);
        }
        *active = Some(repo.clone());
        tracing::info!("Repository set: {} → {}", repo.url, repo.local_dir.display());

        self.provisioner.install_requirements(&repo).await?;
        Ok(repo)
    }

    /// Start the script at `key` (relative to the repository root).
    /// A bot already running under the key is stopped first.
    pub async fn start(&self, key: &str) -> Result<StartedBot, SupervisorError> {
        let key = validate_key(key)?;
        let mut state = self.processes.lock().await;
        self.start_locked(&mut state, &key).await
    }

    pub async fn stop(&self, key: &str) -> Result<(), SupervisorError> {
        let key = validate_key(key)?;
        let mut state = self.processes.lock().await;
        self.stop_locked(&mut state, &key).await
    }

    /// Stop then start a running bot. An absent key is `NotRunning`,
    /// unlike `start` which would simply launch it.
    pub async fn restart(&self, key: &str) -> Result<StartedBot, SupervisorError> {
        let key = validate_key(key)?;
        let mut state = self.processes.lock().await;
        if !state.registry.contains(&key) {
            return Err(SupervisorError::NotRunning(key));
        }
        self.stop_locked(&mut state, &key).await?;
        self.start_locked(&mut state, &key).await
    }

    /// Registered bots in start order. Empty when nothing runs.
    pub async fn list(&self) -> Vec<BotStatus> {
        self.processes.lock().await.registry.statuses()
    }

    /// Last `log_tail_chars` characters of the bot's log file.
    pub async fn tail_log(&self, key: &str) -> Result<String, SupervisorError> {
        let key = validate_key(key)?;
        let sink = self.processes.lock().await.logs.get(&key).cloned();
        let not_found = || SupervisorError::NotFound(format!("No logs found for '{}'", key));
        let sink = sink.ok_or_else(not_found)?;
        sink.tail(self.log_tail_chars)?.ok_or_else(not_found)
    }

    /// Stop every registered bot. Errors are logged and skipped.
    pub async fn shutdown(&self) {
        let mut state = self.processes.lock().await;
        let keys = state.registry.keys();
        if keys.is_empty() {
            return;
        }
        tracing::info!("Stopping {} bot(s)", keys.len());
        for key in keys {
            if let Err(e) = self.stop_locked(&mut state, &key).await {
                tracing::error!("Failed to stop '{}' during shutdown: {}", key, e);
            }
        }
    }

    async fn start_locked(
        &self,
        state: &mut ProcessState,
        key: &str,
    ) -> Result<StartedBot, SupervisorError> {
        let repo = self
            .repository
            .read()
            .await
            .clone()
            .filter(|r| r.local_dir.is_dir())
            .ok_or_else(|| {
                SupervisorError::PreconditionFailed(
                    "No repository configured. Provision one first".into(),
                )
            })?;

        let script = repo.local_dir.join(key);
        if !script.is_file() {
            return Err(SupervisorError::NotFound(format!("File '{}' not found", key)));
        }
        // the child runs inside the checkout, so hand it an absolute path
        let script = std::fs::canonicalize(&script)?;

        if state.registry.contains(key) {
            tracing::info!("Bot '{}' is already running, replacing it", key);
            self.stop_locked(state, key).await?;
        }

        let sink = state.logs.sink_for(key);
        sink.append_marker(STARTING_MARKER)?;

        let process =
            match ManagedProcess::spawn(key, &self.interpreter, &script, &repo.local_dir, &sink) {
                Ok(process) => process,
                Err(e) => {
                    let marker = format!("{}: {:#}", START_FAILED_MARKER, e);
                    if let Err(marker_err) = sink.append_marker(&marker) {
                        tracing::warn!(
                            "Could not write failure marker for '{}': {:#}",
                            key,
                            marker_err
                        );
                    }
                    return Err(e.into());
                }
            };
        let started = StartedBot {
            key: key.to_string(),
            pid: process.pid,
            log_path: sink.path.clone(),
        };
        state.registry.insert(process);
        tracing::info!("Bot '{}' started with PID {}", key, started.pid);
        Ok(started)
    }

    /// The one termination routine: graceful request, wait up to the grace
    /// period, forced kill, "stopped" marker, registry removal.
    async fn stop_locked(&self, state: &mut ProcessState, key: &str) -> Result<(), SupervisorError> {
        let process = state
            .registry
            .get(key)
            .ok_or_else(|| SupervisorError::NotRunning(key.to_string()))?;

        if process.is_running() {
            if let Err(e) = process.terminate(false) {
                tracing::warn!("Graceful stop of '{}' failed: {:#}", key, e);
            }
            if !process.wait_for_exit(self.grace_period).await {
                tracing::warn!(
                    "Bot '{}' still running after {:?}, killing it",
                    key,
                    self.grace_period
                );
                process.terminate(true)?;
                if !process.wait_for_exit(KILL_REAP_TIMEOUT).await {
                    tracing::error!("Bot '{}' (pid {}) did not exit after kill", key, process.pid);
                }
            }
        } else {
            tracing::debug!("Bot '{}' had already exited", key);
        }

        let sink = state.logs.sink_for(key);
        if let Err(e) = sink.append_marker(STOPPED_MARKER) {
            tracing::warn!("Could not write stop marker for '{}': {:#}", key, e);
        }
        state.registry.remove(key);
        tracing::info!("Bot '{}' stopped", key);
        Ok(())
    }
}

/// Trim a raw key, make sure it names a path inside the repository and
/// return its canonical form: normal components joined with `/`.
/// `./a.py`, `a.py` and `bots//a.py` vs `bots/a.py` map to one key.
pub fn validate_key(raw: &str) -> Result<String, SupervisorError> {
    let key = raw.trim();
    let mut parts = Vec::new();
    for component in Path::new(key).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(SupervisorError::InvalidArgument(format!(
                    "'{}' must be a path relative to the repository root",
                    key
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(SupervisorError::InvalidArgument(
            "Script path is required, e.g. bot.py".into(),
        ));
    }
    Ok(parts.join("/"))
}


/// Lifecycle tests run real children. `sh` stands in for the interpreter:
/// it accepts the `-u` flag the supervisor passes.
#[cfg(all(test, unix))]
mod lifecycle_tests {
    use super::*;
    use std::time::Instant;

    struct Fixture {
        _tmp: tempfile::TempDir,
        supervisor: Supervisor,
        repo_dir: PathBuf,
        logs_dir: PathBuf,
    }

    async fn fixture() -> Fixture {
        fixture_with_interpreter("sh").await
    }

    async fn fixture_with_interpreter(interpreter: &str) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let base_dir = tmp.path().join("git_bots");
        let repo_dir = base_dir.join("bots");
        let logs_dir = tmp.path().join("bot_logs");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join("sleeper.sh"), "exec sleep 30\n").unwrap();
        std::fs::write(repo_dir.join("quick.sh"), "echo hello from quick\n").unwrap();
        std::fs::write(
            repo_dir.join("stubborn.sh"),
            "trap '' TERM\nwhile true; do sleep 0.1; done\n",
        )
        .unwrap();
        std::fs::create_dir_all(repo_dir.join("nested")).unwrap();
        std::fs::write(repo_dir.join("nested/inner.sh"), "exec sleep 30\n").unwrap();

        let config = GlobalConfig {
            base_dir: base_dir.clone(),
            logs_dir: logs_dir.clone(),
            interpreter: interpreter.into(),
            grace_period_ms: 300,
            ..GlobalConfig::default()
        };
        let provisioner = Provisioner::new(&base_dir, "git", interpreter);
        provisioner
            .save_state(&RepositoryState {
                url: "https://github.com/user/bots".into(),
                local_dir: repo_dir.clone(),
            })
            .unwrap();

        let supervisor = Supervisor::new(&config);
        supervisor.initialize().await.unwrap();
        Fixture {
            _tmp: tmp,
            supervisor,
            repo_dir,
            logs_dir,
        }
    }

    fn pid_alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_start_stop_writes_markers() {
        let f = fixture().await;
        assert!(f.repo_dir.is_dir());

        let started = f.supervisor.start("sleeper.sh").await.unwrap();
        assert_eq!(started.key, "sleeper.sh");
        assert_eq!(started.log_path, f.logs_dir.join("sleeper.sh.log"));

        let list = f.supervisor.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].key, "sleeper.sh");
        assert_eq!(list[0].pid, started.pid);
        assert!(list[0].alive);

        f.supervisor.stop("sleeper.sh").await.unwrap();
        assert!(f.supervisor.list().await.is_empty());
        assert!(!pid_alive(started.pid));

        let log = std::fs::read_to_string(&started.log_path).unwrap();
        let starting = log.find(STARTING_MARKER).unwrap();
        let stopped = log.find(STOPPED_MARKER).unwrap();
        assert!(starting < stopped);

        // stopping again is NotRunning and changes nothing
        assert!(matches!(
            f.supervisor.stop("sleeper.sh").await,
            Err(SupervisorError::NotRunning(_))
        ));
        assert_eq!(std::fs::read_to_string(&started.log_path).unwrap(), log);
    }

    #[tokio::test]
    async fn test_start_replaces_running_bot() {
        let f = fixture().await;
        let first = f.supervisor.start("sleeper.sh").await.unwrap();
        let second = f.supervisor.start("sleeper.sh").await.unwrap();

        assert_ne!(first.pid, second.pid);
        assert!(!pid_alive(first.pid));
        let list = f.supervisor.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].pid, second.pid);

        let log = std::fs::read_to_string(&second.log_path).unwrap();
        assert_eq!(log.matches(STARTING_MARKER).count(), 2);
        assert_eq!(log.matches(STOPPED_MARKER).count(), 1);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_dot_prefixed_key_is_same_bot() {
        let f = fixture().await;
        let first = f.supervisor.start("sleeper.sh").await.unwrap();
        let second = f.supervisor.start("./sleeper.sh").await.unwrap();

        assert_eq!(second.key, "sleeper.sh");
        assert_eq!(second.log_path, first.log_path);
        assert!(!pid_alive(first.pid));
        let list = f.supervisor.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].key, "sleeper.sh");
        assert_eq!(list[0].pid, second.pid);

        f.supervisor.stop("././sleeper.sh").await.unwrap();
        assert!(f.supervisor.list().await.is_empty());
        assert!(!pid_alive(second.pid));
    }

    #[tokio::test]
    async fn test_start_errors() {
        let f = fixture().await;
        assert!(matches!(
            f.supervisor.start("missing.sh").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            f.supervisor.start("nested").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            f.supervisor.start("../bots/sleeper.sh").await,
            Err(SupervisorError::InvalidArgument(_))
        ));
        assert!(f.supervisor.list().await.is_empty());
        // nothing was started, so no log was recorded
        assert!(matches!(
            f.supervisor.tail_log("missing.sh").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_logged() {
        let f = fixture_with_interpreter("definitely-not-an-interpreter").await;
        let err = f.supervisor.start("sleeper.sh").await.unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert!(f.supervisor.list().await.is_empty());

        let log = f.supervisor.tail_log("sleeper.sh").await.unwrap();
        let starting = log.find(STARTING_MARKER).unwrap();
        let failed = log.find(START_FAILED_MARKER).unwrap();
        assert!(starting < failed);
        assert!(log.contains("definitely-not-an-interpreter"));
    }

    #[tokio::test]
    async fn test_forced_kill_after_grace_period() {
        let f = fixture().await;
        let started = f.supervisor.start("stubborn.sh").await.unwrap();
        // give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let t0 = Instant::now();
        f.supervisor.stop("stubborn.sh").await.unwrap();
        assert!(t0.elapsed() >= Duration::from_millis(300));
        assert!(!pid_alive(started.pid));
        assert!(f.supervisor.list().await.is_empty());

        let log = std::fs::read_to_string(&started.log_path).unwrap();
        assert!(log.contains("Process exited with"));
        assert!(log.trim_end().ends_with(STOPPED_MARKER));
    }

    #[tokio::test]
    async fn test_restart() {
        let f = fixture().await;
        assert!(matches!(
            f.supervisor.restart("sleeper.sh").await,
            Err(SupervisorError::NotRunning(_))
        ));

        let first = f.supervisor.start("sleeper.sh").await.unwrap();
        let second = f.supervisor.restart("sleeper.sh").await.unwrap();
        assert_ne!(first.pid, second.pid);
        assert_eq!(f.supervisor.list().await.len(), 1);

        f.supervisor.shutdown().await;
        assert!(f.supervisor.list().await.is_empty());
        assert!(!pid_alive(second.pid));
    }

    #[tokio::test]
    async fn test_exited_bot_stays_listed_until_stopped() {
        let f = fixture().await;
        let started = f.supervisor.start("quick.sh").await.unwrap();

        let mut alive = true;
        for _ in 0..50 {
            alive = f.supervisor.list().await[0].alive;
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive);
        assert_eq!(f.supervisor.list().await[0].pid, started.pid);

        let log = f.supervisor.tail_log("quick.sh").await.unwrap();
        assert!(log.contains("hello from quick"));

        f.supervisor.stop("quick.sh").await.unwrap();
        assert!(f.supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_keeps_start_order() {
        let f = fixture().await;
        f.supervisor.start("sleeper.sh").await.unwrap();
        f.supervisor.start("nested/inner.sh").await.unwrap();

        let keys: Vec<String> = f.supervisor.list().await.into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["sleeper.sh", "nested/inner.sh"]);
        assert!(f.logs_dir.join("nested").join("inner.sh.log").exists());

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_tail_log_after_file_removed() {
        let f = fixture().await;
        let started = f.supervisor.start("sleeper.sh").await.unwrap();
        f.supervisor.stop("sleeper.sh").await.unwrap();

        let tail = f.supervisor.tail_log("sleeper.sh").await.unwrap();
        assert!(tail.contains(STOPPED_MARKER));

        std::fs::remove_file(&started.log_path).unwrap();
        assert!(matches!(
            f.supervisor.tail_log("sleeper.sh").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tail_log_window() {
        let f = fixture().await;
        let started = f.supervisor.start("sleeper.sh").await.unwrap();
        f.supervisor.stop("sleeper.sh").await.unwrap();

        let filler = "x".repeat(5000);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&started.log_path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, filler.as_bytes()))
            .unwrap();

        let full = std::fs::read_to_string(&started.log_path).unwrap();
        let tail = f.supervisor.tail_log("sleeper.sh").await.unwrap();
        assert_eq!(tail.chars().count(), 4000);
        assert!(full.ends_with(&tail));
    }
}
