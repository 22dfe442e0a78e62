//! Backup engine - Orchestrates one run end to end.
//!
//! Classify → stage (copy + encrypt + manifest) → route to exactly one
//! destination:
//! - local storage, followed by retention
//! - the git snapshot engine, committing the artifact into a working copy
//! - the git-object API writer, committing the staged tree directly
//!
//! Every public operation returns a `RunOutcome`; errors never escape.

pub mod archive;
pub mod manifest;
pub mod outcome;
pub mod retention;
pub mod router;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, SyncMode, SyncPolicy};
use crate::crypto::{EncryptionManager, ENCRYPTED_SUFFIX};
use crate::fs::classify::{to_slash, Classifier, Partition};
use crate::sync::{
    ApiWriter, GitBackend, GitCli, GitHubClient, ObjectStore, SnapshotEngine, SnapshotOptions,
    UploadFile,
};
use crate::utils::{EngineError, ErrorKind, FileIssue, Result};
use archive::{Archive, StagedBackup};
use manifest::ManifestStats;
use outcome::{RunOutcome, RunStats};
use router::Destination;

/// Directory inside the git working copy that receives artifacts
pub const GIT_BACKUP_DIR: &str = "backups";

/// Files selected for a run, with its id and timestamp
struct PreparedRun {
    id: String,
    created_at: DateTime<Utc>,
    partition: Partition,
}

fn stats_from(stats: ManifestStats) -> RunStats {
    RunStats {
        regular_count: stats.regular_count,
        route_special_count: stats.route_special_count,
        encrypted_count: stats.encrypted_count,
        ..RunStats::default()
    }
}

/// Path of a staged file in the remote tree
fn remote_path(prefix: &str, relative: &Path) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        to_slash(relative)
    } else {
        format!("{}/{}", prefix, to_slash(relative))
    }
}

pub struct Engine {
    config: Config,
    encryption: Option<EncryptionManager>,
}

impl Engine {
    pub fn new(config: Config, encryption: Option<EncryptionManager>) -> Self {
        Self { config, encryption }
    }

    /// Resolve secrets from the environment and load the encryption key once.
    pub fn from_env(mut config: Config) -> Result<Self> {
        config.resolve_env();
        let encryption = EncryptionManager::from_env(&config.encryption.key_env)?;
        if encryption.is_none() {
            warn!(
                "{} is not set; sensitive files will be excluded from backups",
                config.encryption.key_env
            );
        }
        Ok(Self::new(config, encryption))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a backup and hand it to the configured destination.
    pub async fn create_backup(&self) -> RunOutcome {
        self.run(None, None).await
    }

    /// Build a backup and send it to the remote with an explicit mode and policy.
    pub async fn sync_to_remote(&self, mode: SyncMode, policy: SyncPolicy) -> RunOutcome {
        self.run(Some(mode), Some(policy)).await
    }

    async fn run(&self, mode: Option<SyncMode>, policy: Option<SyncPolicy>) -> RunOutcome {
        let destination = match router::select(&self.config, mode) {
            Ok(destination) => destination,
            Err(e) => {
                error!("No destination for backup: {}", e);
                return RunOutcome::failed(&e);
            }
        };

        let mut outcome = match &destination {
            Destination::Local { dir } => self.store_local(dir.clone()).await,
            Destination::Git { work_dir } => {
                let git = GitCli::new(work_dir, &self.config.timeouts)
                    .with_secret(self.config.remote.token.clone());
                let policy = policy.unwrap_or(self.config.remote.policy);
                self.sync_with_git(git, work_dir.clone(), policy).await
            }
            Destination::Api => match self.github_client() {
                Ok(client) => self.sync_with_store(Arc::new(client)).await,
                Err(e) => RunOutcome::failed(&e),
            },
        };

        outcome.destination = Some(destination.to_string());
        outcome
    }

    fn github_client(&self) -> Result<GitHubClient> {
        let target = self.config.remote_target();
        GitHubClient::with_base_url(
            self.config.remote.api_base_url.clone(),
            &target.owner,
            &target.repo,
            &target.credential,
            Duration::from_secs(self.config.timeouts.http_secs),
        )
    }

    /// Classify the project, leaving out every directory the engine writes to.
    async fn prepare(&self, work_dir: Option<&Path>) -> Result<PreparedRun> {
        let rules = self.config.selection.clone();
        let root = self.config.project_root();
        let mut exclude = vec![self.config.backup_dir(), self.config.git_work_dir()];
        exclude.extend(work_dir.map(Path::to_path_buf));

        let partition =
            tokio::task::spawn_blocking(move || Classifier::new(&rules, exclude)?.partition(&root))
                .await??;

        let created_at = Utc::now();
        let id = archive::generate_backup_id(&self.config.project.name, created_at);
        info!(backup_id = %id, files = partition.total_selected(), "Starting backup");

        Ok(PreparedRun {
            id,
            created_at,
            partition,
        })
    }

    async fn stage(&self, parent: PathBuf, run: PreparedRun) -> Result<StagedBackup> {
        let config = self.config.clone();
        let encryption = self.encryption.clone();
        tokio::task::spawn_blocking(move || {
            archive::stage(
                &parent,
                &run.id,
                run.created_at,
                &config,
                &run.partition,
                encryption.as_ref(),
            )
        })
        .await?
    }

    /// Stage, publish and prune in the local backup directory.
    async fn store_local(&self, dir: PathBuf) -> RunOutcome {
        match self.try_store_local(dir).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Local backup failed: {}", e);
                RunOutcome::failed(&e)
            }
        }
    }

    async fn try_store_local(&self, dir: PathBuf) -> Result<RunOutcome> {
        let mut run = self.prepare(None).await?;
        let issues = std::mem::take(&mut run.partition.issues);
        let format = self.config.archive_format();

        let staged = self.stage(dir.clone(), run).await?;
        let mut outcome = RunOutcome::succeeded(staged.id.clone()).with_issues(issues);
        outcome.stats = RunStats {
            skipped_count: outcome.stats.skipped_count,
            ..stats_from(staged.stats())
        };
        outcome = outcome.with_issues(staged.issues.clone());

        let publish_dir = dir.clone();
        let archive: Archive =
            tokio::task::spawn_blocking(move || archive::finalize(staged, &publish_dir, format))
                .await??;
        outcome.stats.size_bytes = archive.size_bytes;

        let max_backups = self.config.storage.local.max_backups;
        let prune_dir = dir.clone();
        match tokio::task::spawn_blocking(move || retention::prune(&prune_dir, max_backups)).await? {
            Ok(report) => {
                outcome.stats.deleted_count = report.deleted.len();
                outcome.stats.retained_count = report.kept.len();
                outcome = outcome.with_warnings(report.issues);
            }
            Err(e) => {
                warn!("Retention skipped: {}", e);
                outcome = outcome.with_warnings(vec![FileIssue::from_error(
                    dir.to_string_lossy(),
                    &e,
                )]);
            }
        }

        info!(backup_id = %archive.id, size_bytes = archive.size_bytes, "Backup completed");
        Ok(outcome)
    }

    /// Run the git snapshot engine on `work_dir` with the given backend.
    pub async fn sync_with_git<G: GitBackend>(
        &self,
        git: G,
        work_dir: PathBuf,
        policy: SyncPolicy,
    ) -> RunOutcome {
        match self.try_sync_with_git(git, work_dir, policy).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Git sync failed: {}", e);
                RunOutcome::failed(&e)
            }
        }
    }

    async fn try_sync_with_git<G: GitBackend>(
        &self,
        git: G,
        work_dir: PathBuf,
        policy: SyncPolicy,
    ) -> Result<RunOutcome> {
        // everything under the working copy is reset, staged and pushed
        if self.config.work_dir_contains_project(&work_dir) {
            return Err(EngineError::Config(format!(
                "git work dir {} must not contain the project root",
                work_dir.display()
            )));
        }

        let remote = &self.config.remote;
        let target = self.config.remote_target();
        let options = SnapshotOptions {
            branch: target.branch,
            remote_url: remote.authenticated_url(),
            author: target.commit_author,
            sync_from_remote: remote.sync_from_remote,
            policy,
            allow_force_push: remote.allow_force_push,
            stage_path: GIT_BACKUP_DIR.to_string(),
        };

        let mut run = self.prepare(Some(&work_dir)).await?;
        let mut issues = std::mem::take(&mut run.partition.issues);
        let message = format!("Backup {} at {}", run.id, run.created_at.to_rfc3339());
        let backup_dir = work_dir.join(GIT_BACKUP_DIR);
        let format = self.config.archive_format();

        let mut placed: Option<(Archive, ManifestStats)> = None;
        let place = async {
            let staged = self.stage(backup_dir.clone(), run).await?;
            let stats = staged.stats();
            issues.extend(staged.issues.clone());
            let archive =
                tokio::task::spawn_blocking(move || archive::finalize(staged, &backup_dir, format))
                    .await??;
            placed = Some((archive, stats));
            Ok::<(), EngineError>(())
        };

        let result = SnapshotEngine::new(git, options).run(&message, place).await?;

        let mut outcome = RunOutcome::succeeded(result.commit.clone()).with_issues(issues);
        if let Some((archive, stats)) = placed {
            let skipped = outcome.stats.skipped_count;
            outcome.stats = RunStats {
                skipped_count: skipped,
                size_bytes: archive.size_bytes,
                ..stats_from(stats)
            };
        }
        outcome = outcome.with_warnings(
            result
                .warnings
                .iter()
                .map(|w| FileIssue::new("remote", ErrorKind::Transient, w.as_str()))
                .collect(),
        );
        outcome.push = result.push;
        outcome.forced_rewrite = result.forced_rewrite;

        info!(
            commit = %result.commit,
            state = ?result.state,
            forced_rewrite = result.forced_rewrite,
            "Git sync finished"
        );
        Ok(outcome)
    }

    /// Commit the staged tree through an object store.
    pub async fn sync_with_store<S: ObjectStore + 'static>(&self, store: Arc<S>) -> RunOutcome {
        match self.try_sync_with_store(store).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("API sync failed: {}", e);
                RunOutcome::failed(&e)
            }
        }
    }

    async fn try_sync_with_store<S: ObjectStore + 'static>(&self, store: Arc<S>) -> Result<RunOutcome> {
        let remote = &self.config.remote;
        let target = self.config.remote_target();
        let mut run = self.prepare(None).await?;
        let issues = std::mem::take(&mut run.partition.issues);
        let message = format!("Backup {} at {}", run.id, run.created_at.to_rfc3339());

        // staged outside the project; removed when `staged` drops
        let staged = self.stage(std::env::temp_dir(), run).await?;
        let files: Vec<UploadFile> = staged
            .files()
            .into_iter()
            .map(|relative| UploadFile {
                remote_path: remote_path(&remote.path_prefix, &relative),
                source: staged.path().join(&relative),
            })
            .collect();

        info!(repository = %target.repository(), branch = %target.branch, files = files.len(), "Writing through object API");
        let writer = ApiWriter::new(
            store,
            target.branch,
            target.commit_author,
            remote.max_concurrent_uploads,
        );
        let report = writer.write(files, &message).await?;

        let mut outcome = RunOutcome::succeeded(report.commit_sha.clone()).with_issues(issues);
        let skipped = outcome.stats.skipped_count;
        outcome.stats = RunStats {
            skipped_count: skipped,
            uploaded_count: report.uploaded,
            ..stats_from(staged.stats())
        };
        outcome = outcome
            .with_issues(staged.issues.clone())
            .with_issues(report.issues);

        info!(
            backup_id = %staged.id,
            reference = %report.updated_ref.ref_name,
            commit = %report.updated_ref.commit_sha,
            "API sync finished"
        );
        Ok(outcome)
    }

    /// Local backups, newest first.
    pub async fn list_backups(&self) -> RunOutcome {
        let dir = self.config.backup_dir();
        let listed = tokio::task::spawn_blocking(move || retention::list_backups(&dir)).await;
        match listed.map_err(EngineError::from).and_then(|r| r) {
            Ok(backups) => RunOutcome {
                success: true,
                stats: RunStats {
                    retained_count: backups.len(),
                    ..RunStats::default()
                },
                backups,
                ..RunOutcome::default()
            },
            Err(e) => RunOutcome::failed(&e),
        }
    }

    /// Apply retention to the local backup directory.
    pub async fn prune_backups(&self) -> RunOutcome {
        let dir = self.config.backup_dir();
        let max_backups = self.config.storage.local.max_backups;
        let pruned = tokio::task::spawn_blocking(move || retention::prune(&dir, max_backups)).await;
        match pruned.map_err(EngineError::from).and_then(|r| r) {
            Ok(report) => {
                let mut outcome = RunOutcome {
                    success: true,
                    ..RunOutcome::default()
                };
                outcome.stats.deleted_count = report.deleted.len();
                outcome.stats.retained_count = report.kept.len();
                outcome.with_warnings(report.issues)
            }
            Err(e) => RunOutcome::failed(&e),
        }
    }

    /// Extract a local backup into `target`, decrypting sensitive files.
    pub async fn restore_backup(&self, id: &str, target: &Path) -> RunOutcome {
        let dir = self.config.backup_dir();
        let id = id.to_string();
        let target = target.to_path_buf();
        let encryption = self.encryption.clone();

        let restored = tokio::task::spawn_blocking(move || {
            restore_blocking(&dir, &id, &target, encryption.as_ref())
        })
        .await;
        match restored.map_err(EngineError::from).and_then(|r| r) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Restore failed: {}", e);
                RunOutcome::failed(&e)
            }
        }
    }
}

fn restore_blocking(
    dir: &Path,
    id: &str,
    target: &Path,
    encryption: Option<&EncryptionManager>,
) -> Result<RunOutcome> {
    let backup = retention::list_backups(dir)?
        .into_iter()
        .find(|b| b.id == id)
        .ok_or_else(|| EngineError::NotFound(format!("backup {}", id)))?;

    let mut issues = Vec::new();
    let written = archive::unpack(&backup.path, backup.format, target, &mut issues)?;
    let mut stats = RunStats::default();

    for relative in written {
        let encrypted = to_slash(&relative);
        let Some(original) = encrypted.strip_suffix(ENCRYPTED_SUFFIX) else {
            stats.regular_count += 1;
            continue;
        };
        let Some(manager) = encryption else {
            issues.push(FileIssue::new(
                original,
                ErrorKind::Configuration,
                "left encrypted: no encryption key configured",
            ));
            continue;
        };

        let source = target.join(&relative);
        match manager.decrypt_file(&source, &target.join(original)) {
            Ok(()) => {
                std::fs::remove_file(&source)?;
                stats.encrypted_count += 1;
            }
            Err(e) => {
                warn!(path = %original, "Could not decrypt file: {}", e);
                issues.push(FileIssue::from_error(original, &e));
            }
        }
    }

    info!(backup_id = %id, target = %target.display(), "Backup restored");
    let mut outcome = RunOutcome::succeeded(id).with_issues(issues);
    outcome.stats = RunStats {
        skipped_count: outcome.stats.skipped_count,
        ..stats
    };
    Ok(outcome)
}
