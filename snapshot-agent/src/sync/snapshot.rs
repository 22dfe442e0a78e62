//! Git snapshot state machine.
//!
//! Drives a working copy through
//! `Uninitialized → Initialized → RemoteConfigured → Synced → Committed → Pushed`.
//! States only move forward; a step that is skipped (no remote, sync disabled,
//! nothing to commit) leaves the state where it is. Remote problems degrade to
//! a local-only result, while failures of local git commands end the run.

use serde::Serialize;
use std::future::Future;
use tracing::{error, info, warn};

use super::git::{GitBackend, PushError, PushMode};
use super::github::GitObjectRef;
use crate::config::{CommitAuthor, SyncPolicy};
use crate::executor::outcome::PushReport;
use crate::utils::logger::redact_url;
use crate::utils::{EngineError, Result};

/// Commit id reported when there was nothing to commit
pub const NO_CHANGES: &str = "no-changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Uninitialized,
    Initialized,
    RemoteConfigured,
    Synced,
    Committed,
    Pushed,
}

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub branch: String,
    /// Remote URL, credential embedded
    pub remote_url: Option<String>,
    pub author: CommitAuthor,
    pub sync_from_remote: bool,
    pub policy: SyncPolicy,
    pub allow_force_push: bool,
    /// Path inside the working copy that is staged; nothing else is committed
    pub stage_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResult {
    pub state: SyncState,
    /// Commit id, or `NO_CHANGES`
    pub commit: String,
    pub committed: bool,
    /// Local branch head after the commit
    pub head: Option<GitObjectRef>,
    /// Absent when nothing was committed
    pub push: Option<PushReport>,
    pub forced_rewrite: bool,
    pub warnings: Vec<String>,
}

pub struct SnapshotEngine<G: GitBackend> {
    git: G,
    options: SnapshotOptions,
    state: SyncState,
    /// Why the remote is out of reach, once known
    remote_failure: Option<String>,
    warnings: Vec<String>,
}

impl<G: GitBackend> SnapshotEngine<G> {
    pub fn new(git: G, options: SnapshotOptions) -> Self {
        Self {
            git,
            options,
            state: SyncState::Uninitialized,
            remote_failure: None,
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn backend(&self) -> &G {
        &self.git
    }

    fn advance(&mut self, next: SyncState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        if next > self.state {
            info!(from = ?self.state, to = ?next, "Snapshot state changed");
            self.state = next;
        }
    }

    fn degrade(&mut self, step: &str, error: &EngineError) {
        let message = format!("{} failed: {}", step, error);
        warn!("Continuing without remote: {}", message);
        self.warnings.push(message.clone());
        self.remote_failure.get_or_insert(message);
    }

    /// Create the repository and identity if they do not exist yet.
    pub async fn initialize(&mut self) -> Result<()> {
        if !self.git.has_repository().await? {
            info!(branch = %self.options.branch, "Initializing repository");
            self.git.init(&self.options.branch).await?;
            self.git.set_identity(&self.options.author).await?;
        }
        self.advance(SyncState::Initialized);
        Ok(())
    }

    /// Point the remote at the configured URL. Failure degrades to local-only.
    pub async fn configure_remote(&mut self) {
        let Some(url) = self.options.remote_url.clone() else {
            self.degrade("remote configuration", &EngineError::Config("no remote url".into()));
            return;
        };
        match self.git.configure_remote(&url).await {
            Ok(()) => {
                info!(remote = %redact_url(&url), "Remote configured");
                self.advance(SyncState::RemoteConfigured);
            }
            Err(e) => self.degrade("remote configuration", &e),
        }
    }

    /// Bring the working copy up to date with the remote branch.
    ///
    /// Only a failed hard reset is an error; fetch failures degrade and a
    /// failed rebase-pull is aborted so the run continues with local state.
    pub async fn sync(&mut self) -> Result<()> {
        if self.remote_failure.is_some() || !self.options.sync_from_remote {
            return Ok(());
        }

        if let Err(e) = self.git.fetch().await {
            self.degrade("fetch", &e);
            return Ok(());
        }

        let branch = self.options.branch.clone();
        if self.git.remote_branch_exists(&branch).await? {
            match self.options.policy {
                SyncPolicy::Override => {
                    info!(branch = %branch, "Resetting working copy to remote tip");
                    self.git.reset_hard_to_remote(&branch).await?;
                }
                SyncPolicy::Merge => {
                    if let Err(e) = self.git.pull_rebase(&branch).await {
                        let message = format!("rebase-pull failed, keeping local state: {}", e);
                        warn!("{}", message);
                        self.warnings.push(message);
                        if let Err(abort) = self.git.abort_rebase().await {
                            warn!("rebase --abort: {}", abort);
                        }
                    }
                }
            }
        } else {
            info!(branch = %branch, "Remote branch does not exist yet");
        }

        self.advance(SyncState::Synced);
        Ok(())
    }

    /// Stage the artifact path and commit. Returns `None` when nothing was staged.
    pub async fn commit(&mut self, message: &str) -> Result<Option<String>> {
        self.git.stage(&self.options.stage_path).await?;
        if !self.git.has_staged_changes().await? {
            info!("No changes to commit");
            return Ok(None);
        }

        let commit = self.git.commit(message, &self.options.author).await?;
        info!(commit = %commit, "Committed snapshot");
        self.advance(SyncState::Committed);
        Ok(Some(commit))
    }

    /// Push the branch: plain, then with explicit upstream, then (if allowed
    /// and the rejection was non-fast-forward) forced.
    ///
    /// Returns the report and whether remote history was rewritten.
    pub async fn push(&mut self) -> (PushReport, bool) {
        let mut report = PushReport::default();

        if let Some(reason) = &self.remote_failure {
            report.detail = Some(reason.clone());
            return (report, false);
        }

        let branch = self.options.branch.clone();
        let mut last_error = None;

        for mode in [PushMode::Plain, PushMode::SetUpstream] {
            report.attempts += 1;
            match self.git.push(&branch, mode).await {
                Ok(()) => {
                    info!(branch = %branch, ?mode, "Pushed snapshot");
                    report.push_success = true;
                    self.advance(SyncState::Pushed);
                    return (report, false);
                }
                Err(e) => {
                    warn!(?mode, "Push attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(PushError::NonFastForward(detail)) if self.options.allow_force_push => {
                warn!(branch = %branch, "Push rejected as non-fast-forward, force-pushing");
                report.attempts += 1;
                match self.git.push(&branch, PushMode::Force).await {
                    Ok(()) => {
                        warn!(branch = %branch, "Remote history rewritten by force-push");
                        report.push_success = true;
                        self.advance(SyncState::Pushed);
                        (report, true)
                    }
                    Err(e) => {
                        error!("Force-push failed: {}", e);
                        report.detail = Some(format!("{}; force-push failed: {}", detail, e));
                        (report, false)
                    }
                }
            }
            Some(PushError::NonFastForward(detail)) => {
                report.detail = Some(format!("{} (force-push not allowed)", detail));
                (report, false)
            }
            Some(e) => {
                report.detail = Some(e.to_string());
                (report, false)
            }
            None => (report, false),
        }
    }

    /// Full pass. `place_artifact` runs after the sync step and before staging.
    pub async fn run<F>(mut self, message: &str, place_artifact: F) -> Result<SnapshotResult>
    where
        F: Future<Output = Result<()>>,
    {
        self.initialize().await?;
        self.configure_remote().await;
        self.sync().await?;
        place_artifact.await?;

        let Some(commit) = self.commit(message).await? else {
            return Ok(SnapshotResult {
                state: self.state,
                commit: NO_CHANGES.to_string(),
                committed: false,
                head: None,
                push: None,
                forced_rewrite: false,
                warnings: self.warnings,
            });
        };

        let (push, forced_rewrite) = self.push().await;
        Ok(SnapshotResult {
            state: self.state,
            head: Some(GitObjectRef::branch(&self.options.branch, commit.clone())),
            commit,
            committed: true,
            push: Some(push),
            forced_rewrite,
            warnings: self.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Fake {
        has_repo: bool,
        remote_branch: bool,
        staged: bool,
        fail_fetch: bool,
        fail_pull: bool,
        pushes: VecDeque<std::result::Result<(), PushError>>,
        calls: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeGit(Arc<Mutex<Fake>>);

    impl FakeGit {
        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().calls.clone()
        }

        fn record(&self, call: &str) {
            self.0.lock().unwrap().calls.push(call.to_string());
        }
    }

    #[async_trait]
    impl GitBackend for FakeGit {
        async fn has_repository(&self) -> Result<bool> {
            Ok(self.0.lock().unwrap().has_repo)
        }
        async fn init(&self, _branch: &str) -> Result<()> {
            self.record("init");
            self.0.lock().unwrap().has_repo = true;
            Ok(())
        }
        async fn set_identity(&self, _author: &CommitAuthor) -> Result<()> {
            self.record("identity");
            Ok(())
        }
        async fn configure_remote(&self, _url: &str) -> Result<()> {
            self.record("remote");
            Ok(())
        }
        async fn fetch(&self) -> Result<()> {
            self.record("fetch");
            if self.0.lock().unwrap().fail_fetch {
                return Err(EngineError::Network("could not resolve host".into()));
            }
            Ok(())
        }
        async fn remote_branch_exists(&self, _branch: &str) -> Result<bool> {
            Ok(self.0.lock().unwrap().remote_branch)
        }
        async fn reset_hard_to_remote(&self, _branch: &str) -> Result<()> {
            self.record("reset");
            Ok(())
        }
        async fn pull_rebase(&self, _branch: &str) -> Result<()> {
            self.record("pull");
            if self.0.lock().unwrap().fail_pull {
                return Err(EngineError::Network("conflict".into()));
            }
            Ok(())
        }
        async fn abort_rebase(&self) -> Result<()> {
            self.record("abort");
            Ok(())
        }
        async fn stage(&self, pathspec: &str) -> Result<()> {
            self.record(&format!("add:{}", pathspec));
            Ok(())
        }
        async fn has_staged_changes(&self) -> Result<bool> {
            Ok(self.0.lock().unwrap().staged)
        }
        async fn commit(&self, _message: &str, _author: &CommitAuthor) -> Result<String> {
            self.record("commit");
            Ok("abc123".into())
        }
        async fn push(&self, _branch: &str, mode: PushMode) -> std::result::Result<(), PushError> {
            self.record(&format!("push:{:?}", mode));
            self.0.lock().unwrap().pushes.pop_front().unwrap_or(Ok(()))
        }
    }

    fn options(policy: SyncPolicy) -> SnapshotOptions {
        SnapshotOptions {
            branch: "main".into(),
            remote_url: Some("https://token@github.com/acme/site.git".into()),
            author: CommitAuthor::default(),
            sync_from_remote: true,
            policy,
            allow_force_push: false,
            stage_path: "backups".into(),
        }
    }

    fn fake(f: Fake) -> FakeGit {
        FakeGit(Arc::new(Mutex::new(f)))
    }

    #[tokio::test]
    async fn test_fresh_repository_full_pass() {
        let mut engine = SnapshotEngine::new(
            fake(Fake { staged: true, ..Fake::default() }),
            options(SyncPolicy::Override),
        );
        engine.initialize().await.unwrap();
        assert_eq!(engine.state(), SyncState::Initialized);
        engine.configure_remote().await;
        assert_eq!(engine.state(), SyncState::RemoteConfigured);
        engine.sync().await.unwrap();
        assert_eq!(engine.state(), SyncState::Synced);
        assert_eq!(engine.commit("snapshot").await.unwrap().as_deref(), Some("abc123"));
        let (report, forced) = engine.push().await;
        assert!(report.push_success);
        assert!(!forced);
        assert_eq!(engine.state(), SyncState::Pushed);

        assert_eq!(
            engine.backend().calls(),
            vec!["init", "identity", "remote", "fetch", "add:backups", "commit", "push:Plain"]
        );
    }

    #[tokio::test]
    async fn test_nothing_staged_returns_sentinel() {
        let git = fake(Fake { has_repo: true, ..Fake::default() });
        let result = SnapshotEngine::new(git, options(SyncPolicy::Override))
            .run("snapshot", async { Ok::<(), EngineError>(()) })
            .await
            .unwrap();

        assert_eq!(result.commit, NO_CHANGES);
        assert!(!result.committed);
        assert!(result.head.is_none());
        assert!(result.push.is_none());
        assert_eq!(result.state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_override_resets_existing_branch() {
        let git = fake(Fake {
            has_repo: true,
            remote_branch: true,
            staged: true,
            ..Fake::default()
        });
        let mut engine = SnapshotEngine::new(git, options(SyncPolicy::Override));
        engine.initialize().await.unwrap();
        engine.configure_remote().await;
        engine.sync().await.unwrap();
        assert!(engine.backend().calls().contains(&"reset".to_string()));
    }

    #[tokio::test]
    async fn test_failed_rebase_is_aborted_and_run_continues() {
        let git = fake(Fake {
            has_repo: true,
            remote_branch: true,
            staged: true,
            fail_pull: true,
            ..Fake::default()
        });
        let result = SnapshotEngine::new(git, options(SyncPolicy::Merge))
            .run("snapshot", async { Ok::<(), EngineError>(()) })
            .await
            .unwrap();

        assert!(result.committed);
        assert_eq!(result.state, SyncState::Pushed);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_degrades_to_local_commit() {
        let git = fake(Fake {
            has_repo: true,
            staged: true,
            fail_fetch: true,
            ..Fake::default()
        });
        let mut engine = SnapshotEngine::new(git, options(SyncPolicy::Override));
        engine.initialize().await.unwrap();
        engine.configure_remote().await;
        engine.sync().await.unwrap();
        assert_eq!(engine.state(), SyncState::RemoteConfigured);

        assert!(engine.commit("snapshot").await.unwrap().is_some());
        let (report, forced) = engine.push().await;
        assert!(!report.push_success);
        assert_eq!(report.attempts, 0);
        assert!(report.detail.unwrap().contains("could not resolve host"));
        assert!(!forced);
        assert_eq!(engine.state(), SyncState::Committed);
        assert!(!engine.backend().calls().iter().any(|c| c.starts_with("push")));
    }

    #[tokio::test]
    async fn test_non_fast_forward_without_opt_in_is_not_forced() {
        let git = fake(Fake {
            has_repo: true,
            staged: true,
            pushes: VecDeque::from(vec![
                Err(PushError::NonFastForward("rejected".into())),
                Err(PushError::NonFastForward("rejected".into())),
            ]),
            ..Fake::default()
        });
        let result = SnapshotEngine::new(git, options(SyncPolicy::Override))
            .run("snapshot", async { Ok::<(), EngineError>(()) })
            .await
            .unwrap();

        let push = result.push.unwrap();
        assert!(!push.push_success);
        assert_eq!(push.attempts, 2);
        assert!(!result.forced_rewrite);
        assert_eq!(result.state, SyncState::Committed);
    }

    #[tokio::test]
    async fn test_artifact_placed_after_sync_and_before_staging() {
        let git = fake(Fake { has_repo: true, staged: true, ..Fake::default() });
        let log = git.clone();
        let engine = SnapshotEngine::new(git.clone(), options(SyncPolicy::Override));

        let result = engine
            .run("snapshot", async move {
                log.record("place");
                Ok::<(), EngineError>(())
            })
            .await
            .unwrap();

        assert!(result.committed);
        assert_eq!(
            git.calls(),
            vec!["remote", "fetch", "place", "add:backups", "commit", "push:Plain"]
        );
    }
}
