//! Remote synchronization: git working copy and git-object API.

pub mod api_writer;
pub mod git;
pub mod github;
pub mod snapshot;

pub use api_writer::{ApiWriteReport, ApiWriter, UploadFile};
pub use git::{GitBackend, GitCli, PushError, PushMode};
pub use github::{GitHubClient, GitObjectRef, ObjectStore, TreeEntry};
pub use snapshot::{SnapshotEngine, SnapshotOptions, SnapshotResult, SyncState, NO_CHANGES};
