//! Listing and pruning of local backups.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::archive::{self, Archive};
use crate::config::ArchiveFormat;
use crate::fs::metadata::ArtifactMetadata;
use crate::utils::{ErrorKind, FileIssue, Result};

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub issues: Vec<FileIssue>,
}

/// List backups in `dir`, newest first.
///
/// Hidden entries (in-progress stages and partial archives) are never listed.
/// Creation time comes from the manifest, falling back to the file system.
pub fn list_backups(dir: &Path) -> Result<Vec<Archive>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        let (format, id) = if file_type.is_dir() {
            (ArchiveFormat::Directory, name.clone())
        } else if let Some((format, id)) = ArchiveFormat::from_file_name(&name) {
            (format, id.to_string())
        } else {
            continue;
        };

        let path = entry.path();
        let fs_meta = ArtifactMetadata::from_path(&path).ok();
        let created_at = match archive::read_manifest(&path, format) {
            Ok(manifest) => manifest.timestamp,
            Err(e) => {
                debug!(path = %path.display(), "No readable manifest, using file time: {}", e);
                fs_meta
                    .as_ref()
                    .map(|m| m.created_at)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            }
        };

        backups.push(Archive {
            id,
            path,
            format,
            size_bytes: fs_meta.map(|m| m.size).unwrap_or_default(),
            created_at,
        });
    }

    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    Ok(backups)
}

/// Delete everything beyond the `max_backups` most recent backups.
///
/// A backup that cannot be removed is reported and left in place.
pub fn prune(dir: &Path, max_backups: usize) -> Result<PruneReport> {
    let backups = list_backups(dir)?;
    let mut report = PruneReport::default();

    for (index, backup) in backups.into_iter().enumerate() {
        if index < max_backups {
            report.kept.push(backup.id);
            continue;
        }

        let result = match backup.format {
            ArchiveFormat::Directory => fs::remove_dir_all(&backup.path),
            _ => fs::remove_file(&backup.path),
        };
        match result {
            Ok(()) => {
                info!(backup_id = %backup.id, "Removed old backup");
                report.deleted.push(backup.id);
            }
            Err(e) => {
                warn!(backup_id = %backup.id, "Failed to remove old backup: {}", e);
                report.issues.push(FileIssue::new(
                    backup.path.to_string_lossy(),
                    ErrorKind::PartialFailure,
                    format!("could not delete: {}", e),
                ));
            }
        }
    }

    Ok(report)
}
