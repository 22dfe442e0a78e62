//! Git sync through a scripted backend standing in for the git CLI.

use async_trait::async_trait;
use snapshot_agent::config::{CommitAuthor, Config, SyncPolicy};
use snapshot_agent::crypto::{EncryptionKey, EncryptionManager};
use snapshot_agent::sync::{GitBackend, PushError, PushMode, NO_CHANGES};
use snapshot_agent::utils::{EngineError, ErrorKind, Result};
use snapshot_agent::Engine;
use std::collections::VecDeque;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const REJECTED: &str = "! [rejected] main -> main (non-fast-forward)";

#[derive(Default)]
struct Script {
    staged: bool,
    pushes: VecDeque<std::result::Result<(), PushError>>,
    push_modes: Vec<PushMode>,
    remote_url: Option<String>,
    staged_paths: Vec<String>,
    fail_fetch: bool,
}

#[derive(Clone, Default)]
struct ScriptedGit(Arc<Mutex<Script>>);

impl ScriptedGit {
    fn new(staged: bool, pushes: Vec<std::result::Result<(), PushError>>) -> Self {
        Self(Arc::new(Mutex::new(Script {
            staged,
            pushes: pushes.into(),
            ..Script::default()
        })))
    }

    fn push_modes(&self) -> Vec<PushMode> {
        self.0.lock().unwrap().push_modes.clone()
    }
}

#[async_trait]
impl GitBackend for ScriptedGit {
    async fn has_repository(&self) -> Result<bool> {
        Ok(true)
    }
    async fn init(&self, _branch: &str) -> Result<()> {
        Ok(())
    }
    async fn set_identity(&self, _author: &CommitAuthor) -> Result<()> {
        Ok(())
    }
    async fn configure_remote(&self, url: &str) -> Result<()> {
        self.0.lock().unwrap().remote_url = Some(url.to_string());
        Ok(())
    }
    async fn fetch(&self) -> Result<()> {
        if self.0.lock().unwrap().fail_fetch {
            return Err(EngineError::Network("could not resolve host: github.com".into()));
        }
        Ok(())
    }
    async fn remote_branch_exists(&self, _branch: &str) -> Result<bool> {
        Ok(true)
    }
    async fn reset_hard_to_remote(&self, _branch: &str) -> Result<()> {
        Ok(())
    }
    async fn pull_rebase(&self, _branch: &str) -> Result<()> {
        Ok(())
    }
    async fn abort_rebase(&self) -> Result<()> {
        Ok(())
    }
    async fn stage(&self, pathspec: &str) -> Result<()> {
        self.0.lock().unwrap().staged_paths.push(pathspec.to_string());
        Ok(())
    }
    async fn has_staged_changes(&self) -> Result<bool> {
        Ok(self.0.lock().unwrap().staged)
    }
    async fn commit(&self, _message: &str, _author: &CommitAuthor) -> Result<String> {
        Ok("c0ffee".to_string())
    }
    async fn push(&self, _branch: &str, mode: PushMode) -> std::result::Result<(), PushError> {
        let mut script = self.0.lock().unwrap();
        script.push_modes.push(mode);
        script.pushes.pop_front().unwrap_or(Ok(()))
    }
}

fn rejected() -> std::result::Result<(), PushError> {
    Err(PushError::NonFastForward(REJECTED.to_string()))
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("README.md"), "# api").unwrap();
    fs::write(dir.path().join("schema.sql"), "create table t (id int);").unwrap();
    fs::write(dir.path().join(".env"), "JWT_SECRET=abc").unwrap();
    dir
}

fn engine(root: &TempDir, allow_force_push: bool) -> Engine {
    let mut config = Config::default();
    config.project.name = "api".into();
    config.project.root = root.path().to_path_buf();
    config.remote.enabled = true;
    config.remote.owner = "acme".into();
    config.remote.repo = "api".into();
    config.remote.token = "ghp_test".into();
    config.remote.allow_force_push = allow_force_push;
    Engine::new(config, Some(EncryptionManager::new(&EncryptionKey::generate())))
}

#[tokio::test]
async fn test_non_fast_forward_falls_back_to_force_push() {
    let src = project();
    let work = TempDir::new().unwrap();
    let git = ScriptedGit::new(true, vec![rejected(), rejected(), Ok(())]);

    let outcome = engine(&src, true)
        .sync_with_git(git.clone(), work.path().to_path_buf(), SyncPolicy::Override)
        .await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.artifact.as_deref(), Some("c0ffee"));
    assert!(outcome.forced_rewrite);
    let push = outcome.push.unwrap();
    assert!(push.push_success);
    assert_eq!(push.attempts, 3);
    assert_eq!(
        git.push_modes(),
        vec![PushMode::Plain, PushMode::SetUpstream, PushMode::Force]
    );

    // the artifact was placed in the working copy before committing
    let placed = fs::read_dir(work.path().join("backups")).unwrap().count();
    assert_eq!(placed, 1);
    let script = git.0.lock().unwrap();
    assert_eq!(script.remote_url.as_deref(), Some("https://ghp_test@github.com/acme/api.git"));
    assert_eq!(script.staged_paths, vec!["backups"]);
}

#[tokio::test]
async fn test_force_push_requires_opt_in() {
    let src = project();
    let work = TempDir::new().unwrap();
    let git = ScriptedGit::new(true, vec![rejected(), rejected()]);

    let outcome = engine(&src, false)
        .sync_with_git(git.clone(), work.path().to_path_buf(), SyncPolicy::Override)
        .await;

    assert!(!outcome.forced_rewrite);
    let push = outcome.push.unwrap();
    assert!(!push.push_success);
    assert_eq!(push.attempts, 2);
    assert!(push.detail.unwrap().contains("non-fast-forward"));
    assert!(!git.push_modes().contains(&PushMode::Force));
}

#[tokio::test]
async fn test_nothing_staged_is_a_no_op_success() {
    let src = project();
    let work = TempDir::new().unwrap();
    let git = ScriptedGit::new(false, vec![]);

    let outcome = engine(&src, true)
        .sync_with_git(git.clone(), work.path().to_path_buf(), SyncPolicy::Merge)
        .await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.artifact.as_deref(), Some(NO_CHANGES));
    assert!(outcome.push.is_none());
    assert!(git.push_modes().is_empty());
}

#[tokio::test]
async fn test_remote_warnings_do_not_count_as_skipped_files() {
    let src = project();
    let work = TempDir::new().unwrap();
    let git = ScriptedGit::new(true, vec![]);
    git.0.lock().unwrap().fail_fetch = true;

    let outcome = engine(&src, false)
        .sync_with_git(git.clone(), work.path().to_path_buf(), SyncPolicy::Override)
        .await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.stats.skipped_count, 0);
    assert!(outcome
        .issues
        .iter()
        .any(|i| i.path == "remote" && i.kind == ErrorKind::Transient));
    // degraded to a local-only commit
    let push = outcome.push.unwrap();
    assert!(!push.push_success);
    assert_eq!(push.attempts, 0);
}

#[tokio::test]
async fn test_work_dir_containing_project_is_refused() {
    let src = project();
    let git = ScriptedGit::new(true, vec![]);

    let outcome = engine(&src, false)
        .sync_with_git(git.clone(), src.path().to_path_buf(), SyncPolicy::Override)
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::Configuration);
    assert!(git.0.lock().unwrap().staged_paths.is_empty());
}
