//! Structured result returned by every engine operation.

use serde::{Deserialize, Serialize};

use super::archive::Archive;
use crate::utils::{EngineError, ErrorKind, FileIssue};

/// Counters gathered during a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub regular_count: usize,
    pub route_special_count: usize,
    pub encrypted_count: usize,
    pub skipped_count: usize,
    pub size_bytes: u64,
    pub uploaded_count: usize,
    pub deleted_count: usize,
    pub retained_count: usize,
}

/// What happened to the push in a git sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub push_success: bool,
    /// Number of push attempts made (plain, upstream, forced)
    pub attempts: u32,
    /// Failure detail of the last attempt when the push did not land
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for RunError {
    fn from(error: &EngineError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Summary of one operation. Failures are carried here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    /// Backup id, commit sha, or the no-changes sentinel
    pub artifact: Option<String>,
    /// Destination the run was routed to
    pub destination: Option<String>,
    pub stats: RunStats,
    pub issues: Vec<FileIssue>,
    pub push: Option<PushReport>,
    /// Set whenever a force-push rewrote remote history
    pub forced_rewrite: bool,
    /// Filled by `list-backups`, newest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backups: Vec<Archive>,
    pub error: Option<RunError>,
}

impl RunOutcome {
    pub fn succeeded(artifact: impl Into<String>) -> Self {
        Self {
            success: true,
            artifact: Some(artifact.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: &EngineError) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Files left out of the artifact; each one counts as skipped.
    pub fn with_issues(mut self, issues: Vec<FileIssue>) -> Self {
        self.stats.skipped_count += issues.len();
        self.issues.extend(issues);
        self
    }

    /// Problems that did not cost the artifact a file (remote, retention).
    pub fn with_warnings(mut self, warnings: Vec<FileIssue>) -> Self {
        self.issues.extend(warnings);
        self
    }
}
