//! Repository Provisioner - clone-or-pull one bot repository and install its
//! `requirements.txt` into the ambient Python environment.
//!
//! ## Layout
//! ```text
//! <base_dir>/
//!   repository.json   ← active repository (restored at startup)
//!   <repo-name>/      ← checkout, name = last URL segment without `.git`
//! ```
//!
//! Every subprocess is run with its exit status and stderr captured; a failure
//! becomes `SupervisorError::ProvisionFailed`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::supervisor::error::SupervisorError;
use crate::utils::{apply_creation_flags, display_command};

const STATE_FILE_NAME: &str = "repository.json";
const REQUIREMENTS_FILE: &str = "requirements.txt";
/// How much of a failed command's stderr is kept in the error
const STDERR_TAIL_CHARS: usize = 1000;

/// The single active repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryState {
    pub url: String,
    pub local_dir: PathBuf,
}

/// Directory name for a repository URL: the last path segment with any
/// trailing `/` ignored and a `.git` suffix stripped.
///
/// `https://github.com/user/bots.git` → `bots`, `git@host:user/bots` → `bots`
pub fn repo_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let segment = trimmed.rsplit(['/', ':']).next()?;
    let name = segment.strip_suffix(".git").unwrap_or(segment);
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

pub struct Provisioner {
    base_dir: PathBuf,
    git: String,
    interpreter: String,
}

impl Provisioner {
    pub fn new(base_dir: impl Into<PathBuf>, git: &str, interpreter: &str) -> Self {
        Self {
            base_dir: base_dir.into(),
            git: git.to_string(),
            interpreter: interpreter.to_string(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Validate `url` and derive where it will be checked out.
    pub fn resolve(&self, url: &str) -> Result<RepositoryState, SupervisorError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(SupervisorError::InvalidArgument(
                "Repository URL is required, e.g. https://github.com/username/repo".into(),
            ));
        }
        let name = repo_name_from_url(url).ok_or_else(|| {
            SupervisorError::InvalidArgument(format!(
                "Cannot derive a directory name from '{}'",
                url
            ))
        })?;
        Ok(RepositoryState {
            url: url.to_string(),
            local_dir: self.base_dir.join(name),
        })
    }

    /// `git pull` an existing checkout, `git clone` otherwise.
    pub async fn fetch(&self, repo: &RepositoryState) -> Result<(), SupervisorError> {
        let dir = repo.local_dir.to_string_lossy().into_owned();
        if repo.local_dir.exists() {
            tracing::info!("Updating repository in {}", repo.local_dir.display());
            run_checked(&self.git, &["-C", &dir, "pull"]).await
        } else {
            std::fs::create_dir_all(&self.base_dir)?;
            tracing::info!("Cloning {} into {}", repo.url, repo.local_dir.display());
            run_checked(&self.git, &["clone", &repo.url, &dir]).await
        }
    }

    /// Install `requirements.txt` if the checkout has one.
    /// Returns whether a manifest was found.
    pub async fn install_requirements(
        &self,
        repo: &RepositoryState,
    ) -> Result<bool, SupervisorError> {
        let req_file = repo.local_dir.join(REQUIREMENTS_FILE);
        if !req_file.exists() {
            tracing::debug!("No {} in {}", REQUIREMENTS_FILE, repo.local_dir.display());
            return Ok(false);
        }
        tracing::info!("Installing requirements: {}", req_file.display());
        run_checked(
            &self.interpreter,
            &["-m", "pip", "install", "-r", &req_file.to_string_lossy()],
        )
        .await?;
        Ok(true)
    }

    fn state_file(&self) -> PathBuf {
        self.base_dir.join(STATE_FILE_NAME)
    }

    /// Load the repository recorded by a previous run.
    pub fn load_state(&self) -> anyhow::Result<Option<RepositoryState>> {
        let path = self.state_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    pub fn save_state(&self, repo: &RepositoryState) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let content = serde_json::to_string_pretty(repo)?;
        std::fs::write(self.state_file(), content)?;
        tracing::debug!("Saved repository state for {}", repo.url);
        Ok(())
    }
}

/// Run a command to completion; non-zero exit or launch failure is
/// reported as `ProvisionFailed`.
async fn run_checked(program: &str, args: &[&str]) -> Result<(), SupervisorError> {
    let command_line = display_command(program, args);

    let mut cmd = Command::new(program);
    cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
    apply_creation_flags(&mut cmd);

    let output = cmd.output().await.map_err(|e| SupervisorError::ProvisionFailed {
        command: command_line.clone(),
        exit_code: None,
        stderr_tail: e.to_string(),
    })?;

    if !output.stdout.is_empty() {
        tracing::debug!(
            "`{}` stdout: {}",
            command_line,
            String::from_utf8_lossy(&output.stdout).trim_end()
        );
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim_end();
        let skip = stderr.chars().count().saturating_sub(STDERR_TAIL_CHARS);
        tracing::warn!("`{}` failed with {}", command_line, output.status);
        return Err(SupervisorError::ProvisionFailed {
            command: command_line,
            exit_code: output.status.code(),
            stderr_tail: stderr.chars().skip(skip).collect(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(repo_name_from_url("https://github.com/user/bots").as_deref(), Some("bots"));
        assert_eq!(repo_name_from_url("https://github.com/user/bots.git").as_deref(), Some("bots"));
        assert_eq!(repo_name_from_url("https://github.com/user/bots/").as_deref(), Some("bots"));
        assert_eq!(repo_name_from_url("git@github.com:user/bots.git").as_deref(), Some("bots"));
        assert_eq!(repo_name_from_url("git@host:bots.git").as_deref(), Some("bots"));
        // only the suffix is stripped
        assert_eq!(repo_name_from_url("https://github.com/u/my.github.io").as_deref(), Some("my.github.io"));
        assert_eq!(repo_name_from_url("/srv/git/bots.git").as_deref(), Some("bots"));
        assert_eq!(repo_name_from_url("https://github.com/user/.git"), None);
        assert_eq!(repo_name_from_url("https://github.com/user/.."), None);
        assert_eq!(repo_name_from_url(""), None);
    }

    #[test]
    fn test_resolve() {
        let p = Provisioner::new("git_bots", "git", "python3");
        let repo = p.resolve("  https://github.com/user/bots.git\n").unwrap();
        assert_eq!(repo.url, "https://github.com/user/bots.git");
        assert_eq!(repo.local_dir, PathBuf::from("git_bots").join("bots"));

        assert!(matches!(p.resolve(""), Err(SupervisorError::InvalidArgument(_))));
        assert!(matches!(p.resolve("   "), Err(SupervisorError::InvalidArgument(_))));
        assert!(matches!(p.resolve("https://github.com/user/.git"), Err(SupervisorError::InvalidArgument(_))));
    }

    #[test]
    fn test_state_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let p = Provisioner::new(tmp.path().join("git_bots"), "git", "python3");
        assert!(p.load_state().unwrap().is_none());

        let repo = p.resolve("https://github.com/user/bots").unwrap();
        p.save_state(&repo).unwrap();
        assert_eq!(p.load_state().unwrap(), Some(repo));
    }

    #[tokio::test]
    async fn test_install_without_manifest_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let p = Provisioner::new(tmp.path(), "git", "definitely-not-python");
        let repo = RepositoryState {
            url: "https://github.com/user/bots".into(),
            local_dir: tmp.path().to_path_buf(),
        };
        assert!(!p.install_requirements(&repo).await.unwrap());
    }

    #[tokio::test]
    async fn test_install_failure_is_surfaced() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(REQUIREMENTS_FILE), "requests\n").unwrap();
        let p = Provisioner::new(tmp.path(), "git", "definitely-not-python");
        let repo = RepositoryState {
            url: "https://github.com/user/bots".into(),
            local_dir: tmp.path().to_path_buf(),
        };
        match p.install_requirements(&repo).await {
            Err(SupervisorError::ProvisionFailed { command, exit_code, .. }) => {
                assert!(command.starts_with("definitely-not-python -m pip install -r"));
                assert_eq!(exit_code, None);
            }
            other => panic!("expected ProvisionFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_checked_captures_exit_and_stderr() {
        let err = run_checked("sh", &["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            SupervisorError::ProvisionFailed { command, exit_code, stderr_tail } => {
                assert_eq!(command, "sh -c echo boom >&2; exit 3");
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr_tail, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(run_checked("sh", &["-c", "exit 0"]).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_checked_keeps_stderr_tail() {
        let err = run_checked("sh", &["-c", "head -c 5000 /dev/zero | tr '\\0' x >&2; exit 1"])
            .await
            .unwrap_err();
        if let SupervisorError::ProvisionFailed { stderr_tail, .. } = err {
            assert_eq!(stderr_tail.len(), STDERR_TAIL_CHARS);
        } else {
            panic!("expected ProvisionFailed");
        }
    }

    #[tokio::test]
    async fn test_clone_failure_is_surfaced() {
        let tmp = tempfile::tempdir().unwrap();
        let p = Provisioner::new(tmp.path().join("git_bots"), "definitely-not-git", "python3");
        let repo = p.resolve("https://github.com/user/bots").unwrap();
        let err = p.fetch(&repo).await.unwrap_err();
        assert_eq!(err.error_code(), "PROVISION_FAILED");
        assert!(!repo.local_dir.exists());
    }
}
