//! Custom error types for the snapshot agent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository access error: {0}")]
    RepositoryAccess(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Ref update rejected: {0}")]
    RefUpdate(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Provider API error: {0}")]
    Api(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Error classes reported in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network hiccup; retried only where a component says so
    Transient,
    /// An external call exceeded its deadline
    Timeout,
    /// Missing repository, branch or file
    NotFound,
    /// Authentication tag mismatch on decrypt
    Integrity,
    /// No usable destination or invalid settings
    Configuration,
    /// File skipped by a selection rule or a per-file failure
    PartialFailure,
    /// Irrecoverable setup or terminal failure
    Fatal,
}

/// A per-file problem that excluded the file but did not fail the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIssue {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl FileIssue {
    pub fn new(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_error(path: impl Into<String>, error: &EngineError) -> Self {
        Self::new(path, error.kind(), error.to_string())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::Network(_) => ErrorKind::Transient,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::NotFound(_) | EngineError::RepositoryAccess(_) => ErrorKind::NotFound,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            EngineError::Http(_) => ErrorKind::Transient,
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            EngineError::Io(_)
            | EngineError::Encryption(_)
            | EngineError::Git(_)
            | EngineError::RefUpdate(_)
            | EngineError::Serialization(_)
            | EngineError::Archive(_)
            | EngineError::Api(_)
            | EngineError::Task(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
