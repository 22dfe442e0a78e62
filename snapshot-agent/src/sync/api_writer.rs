//! Commit construction through the provider's object API.
//!
//! Resolve tip → read base tree → create blobs → create tree → create commit
//! → update ref. Blob uploads fan out under a semaphore and must all settle
//! before the tree is built; the ref update is the only step that makes new
//! content visible. Blobs from an aborted run stay orphaned in the remote.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::github::{GitObjectRef, ObjectStore, TreeEntry};
use crate::config::CommitAuthor;
use crate::utils::{EngineError, FileIssue, Result};

/// A local file and the path it takes in the remote tree
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub remote_path: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiWriteReport {
    /// Branch ref after the update
    pub updated_ref: GitObjectRef,
    pub commit_sha: String,
    pub parent_sha: String,
    pub tree_sha: String,
    pub uploaded: usize,
    pub issues: Vec<FileIssue>,
}

pub struct ApiWriter<S: ObjectStore + 'static> {
    store: Arc<S>,
    branch: String,
    author: CommitAuthor,
    max_concurrent: usize,
}

impl<S: ObjectStore + 'static> ApiWriter<S> {
    pub fn new(store: Arc<S>, branch: impl Into<String>, author: CommitAuthor, max_concurrent: usize) -> Self {
        Self {
            store,
            branch: branch.into(),
            author,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Write `files` as one commit on top of the branch tip.
    ///
    /// A file whose blob cannot be created is left out with an issue. A
    /// timeout on any call, or every blob failing, aborts before the ref moves.
    pub async fn write(&self, files: Vec<UploadFile>, message: &str) -> Result<ApiWriteReport> {
        let parent_sha = self.store.get_ref(&self.branch).await.map_err(|e| match e {
            EngineError::RepositoryAccess(_) | EngineError::Timeout(_) => e,
            other => EngineError::RepositoryAccess(format!(
                "branch {} is not accessible: {}",
                self.branch, other
            )),
        })?;
        let base_tree = self.store.get_commit_tree(&parent_sha).await?;
        info!(branch = %self.branch, parent = %parent_sha, files = files.len(), "Uploading blobs");

        let (entries, issues) = self.upload_blobs(files).await?;
        if entries.is_empty() {
            return Err(EngineError::Api("no blob could be created".into()));
        }

        let tree_sha = self.store.create_tree(&base_tree, &entries).await?;
        let commit_sha = self
            .store
            .create_commit(message, &tree_sha, std::slice::from_ref(&parent_sha), &self.author)
            .await?;
        self.store.update_ref(&self.branch, &commit_sha).await?;

        info!(branch = %self.branch, commit = %commit_sha, uploaded = entries.len(), "Branch updated");

        Ok(ApiWriteReport {
            updated_ref: GitObjectRef::branch(&self.branch, commit_sha.clone()),
            commit_sha,
            parent_sha,
            tree_sha,
            uploaded: entries.len(),
            issues,
        })
    }

    async fn upload_blobs(&self, files: Vec<UploadFile>) -> Result<(Vec<TreeEntry>, Vec<FileIssue>)> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(files.len());

        for file in files {
            let sem = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let path = file.remote_path.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Api(format!("Semaphore closed: {}", e)))?;
                let content = tokio::fs::read(&file.source).await?;
                let sha = store.create_blob(&content).await?;
                Ok::<_, EngineError>(TreeEntry::blob(file.remote_path, sha))
            });
            handles.push((path, handle));
        }

        let mut entries = Vec::new();
        let mut issues = Vec::new();
        let mut timeout = None;

        for (path, handle) in handles {
            match handle.await? {
                Ok(entry) => entries.push(entry),
                Err(EngineError::Timeout(message)) => {
                    timeout.get_or_insert(message);
                }
                Err(e) => {
                    warn!(path = %path, "Blob upload failed: {}", e);
                    issues.push(FileIssue::from_error(path, &e));
                }
            }
        }

        if let Some(message) = timeout {
            return Err(EngineError::Timeout(message));
        }
        Ok((entries, issues))
    }
}
