//! File timestamps used when a backup has no readable manifest.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

/// Filesystem facts about a stored backup artifact
#[derive(Debug, Clone)]
pub struct ArtifactMetadata {
    /// Size in bytes (recursive for directories)
    pub size: u64,

    /// Birth time where the platform records it, otherwise last modification
    pub created_at: DateTime<Utc>,
}

impl ArtifactMetadata {
    /// Extract metadata from an artifact path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())?;

        let size = if metadata.is_dir() {
            directory_size(path)
        } else {
            metadata.len()
        };

        Ok(Self {
            size,
            created_at: DateTime::<Utc>::from(created),
        })
    }
}

/// Total size of the regular files below `path`; unreadable entries count as zero
pub fn directory_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
