//! Git working-copy operations.
//!
//! `GitBackend` is the seam the snapshot state machine drives; `GitCli`
//! implements it by running the `git` binary with per-command deadlines.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::{CommitAuthor, TimeoutConfig};
use crate::utils::{EngineError, Result};

/// Remote name used for every sync
pub const REMOTE_NAME: &str = "origin";

/// How a push is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    Plain,
    SetUpstream,
    Force,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push rejected as non-fast-forward: {0}")]
    NonFastForward(String),

    #[error(transparent)]
    Failed(#[from] EngineError),
}

/// Operations on one working copy
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Whether repository metadata exists in the working copy
    async fn has_repository(&self) -> Result<bool>;

    /// Create a repository whose unborn HEAD points at `branch`
    async fn init(&self, branch: &str) -> Result<()>;

    async fn set_identity(&self, author: &CommitAuthor) -> Result<()>;

    /// Point the remote at `url`, adding it if it does not exist
    async fn configure_remote(&self, url: &str) -> Result<()>;

    async fn fetch(&self) -> Result<()>;

    /// Whether `branch` exists on the remote (after a fetch)
    async fn remote_branch_exists(&self, branch: &str) -> Result<bool>;

    async fn reset_hard_to_remote(&self, branch: &str) -> Result<()>;

    async fn pull_rebase(&self, branch: &str) -> Result<()>;

    async fn abort_rebase(&self) -> Result<()>;

    /// Stage additions, changes and deletions below `pathspec` only
    async fn stage(&self, pathspec: &str) -> Result<()>;

    async fn has_staged_changes(&self) -> Result<bool>;

    /// Commit the staged set and return the new commit id
    async fn commit(&self, message: &str, author: &CommitAuthor) -> Result<String>;

    async fn push(&self, branch: &str, mode: PushMode) -> std::result::Result<(), PushError>;
}

/// `GitBackend` backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    work_dir: PathBuf,
    command_timeout: Duration,
    network_timeout: Duration,
    /// Credential scrubbed from any error text
    secret: Option<String>,
}

impl GitCli {
    pub fn new(work_dir: impl Into<PathBuf>, timeouts: &TimeoutConfig) -> Self {
        Self {
            work_dir: work_dir.into(),
            command_timeout: Duration::from_secs(timeouts.command_secs),
            network_timeout: Duration::from_secs(timeouts.network_secs),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.secret = (!secret.is_empty()).then_some(secret);
        self
    }

    fn scrub(&self, text: &str) -> String {
        match &self.secret {
            Some(secret) => text.replace(secret.as_str(), "***"),
            None => text.to_string(),
        }
    }

    /// Run git and return its output regardless of exit status.
    async fn output(&self, args: &[&str], deadline: Duration) -> Result<Output> {
        let subcommand = args.first().copied().unwrap_or("git");
        debug!(subcommand, dir = %self.work_dir.display(), "Running git");

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.work_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        match tokio::time::timeout(deadline, command.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout(format!(
                "git {} exceeded {}s",
                subcommand,
                deadline.as_secs()
            ))),
        }
    }

    fn failure_text(&self, output: &Output) -> String {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).into_owned()
        } else {
            stderr.into_owned()
        };
        self.scrub(text.trim())
    }

    /// Local command; non-zero exit is a git failure.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args, self.command_timeout).await?;
        if !output.status.success() {
            return Err(EngineError::Git(format!(
                "git {}: {}",
                args[0],
                self.failure_text(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Command that talks to the remote; non-zero exit is a network failure.
    async fn run_remote(&self, args: &[&str]) -> Result<Output> {
        let output = self.output(args, self.network_timeout).await?;
        if !output.status.success() {
            return Err(EngineError::Network(format!(
                "git {}: {}",
                args[0],
                self.failure_text(&output)
            )));
        }
        Ok(output)
    }
}

/// Whether git's push output describes a non-fast-forward rejection.
pub fn is_non_fast_forward(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || (stderr.contains("[rejected]") && stderr.contains("updates were rejected"))
}

#[async_trait]
impl GitBackend for GitCli {
    async fn has_repository(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.work_dir.join(".git")).await?)
    }

    async fn init(&self, branch: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        self.run(&["init"]).await?;
        let head = format!("refs/heads/{}", branch);
        self.run(&["symbolic-ref", "HEAD", &head]).await?;
        Ok(())
    }

    async fn set_identity(&self, author: &CommitAuthor) -> Result<()> {
        self.run(&["config", "user.name", &author.name]).await?;
        self.run(&["config", "user.email", &author.email]).await?;
        Ok(())
    }

    async fn configure_remote(&self, url: &str) -> Result<()> {
        if self.run(&["remote", "set-url", REMOTE_NAME, url]).await.is_ok() {
            return Ok(());
        }
        self.run(&["remote", "add", REMOTE_NAME, url]).await?;
        Ok(())
    }

    async fn fetch(&self) -> Result<()> {
        self.run_remote(&["fetch", REMOTE_NAME]).await?;
        Ok(())
    }

    async fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/remotes/{}/{}", REMOTE_NAME, branch);
        let output = self
            .output(&["rev-parse", "--verify", "--quiet", &reference], self.command_timeout)
            .await?;
        Ok(output.status.success())
    }

    async fn reset_hard_to_remote(&self, branch: &str) -> Result<()> {
        let target = format!("{}/{}", REMOTE_NAME, branch);
        self.run(&["reset", "--hard", &target]).await?;
        Ok(())
    }

    async fn pull_rebase(&self, branch: &str) -> Result<()> {
        self.run_remote(&["pull", "--rebase", REMOTE_NAME, branch]).await?;
        Ok(())
    }

    async fn abort_rebase(&self) -> Result<()> {
        self.run(&["rebase", "--abort"]).await?;
        Ok(())
    }

    async fn stage(&self, pathspec: &str) -> Result<()> {
        self.run(&["add", "-A", "--", pathspec]).await?;
        Ok(())
    }

    async fn has_staged_changes(&self) -> Result<bool> {
        let output = self
            .output(&["diff", "--cached", "--quiet"], self.command_timeout)
            .await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(EngineError::Git(format!(
                "git diff: {}",
                self.failure_text(&output)
            ))),
        }
    }

    async fn commit(&self, message: &str, author: &CommitAuthor) -> Result<String> {
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        self.run(&["-c", &name, "-c", &email, "commit", "--no-verify", "-m", message])
            .await?;
        self.run(&["rev-parse", "HEAD"]).await
    }

    async fn push(&self, branch: &str, mode: PushMode) -> std::result::Result<(), PushError> {
        let mut args = vec!["push"];
        match mode {
            PushMode::Plain => {}
            PushMode::SetUpstream => args.push("--set-upstream"),
            PushMode::Force => args.push("--force"),
        }
        args.extend([REMOTE_NAME, branch]);

        let output = self.output(&args, self.network_timeout).await?;
        if output.status.success() {
            return Ok(());
        }

        let text = self.failure_text(&output);
        if is_non_fast_forward(&text) {
            Err(PushError::NonFastForward(text))
        } else {
            Err(PushError::Failed(EngineError::Network(format!("git push: {}", text))))
        }
    }
}
