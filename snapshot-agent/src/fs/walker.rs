//! Directory traversal for snapshot selection.
//!
//! Walks the project tree in a stable (file-name sorted) order, prunes
//! excluded directories before descending, skips symlinks, and reports
//! unreadable entries as warnings instead of aborting the walk.

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Directory names that are never descended into
    pub exclude_dirs: Vec<String>,

    /// Absolute paths that are skipped entirely (backup output, working copies)
    pub exclude_paths: Vec<PathBuf>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            exclude_dirs: vec![
                ".git".to_string(),
                "node_modules".to_string(),
            ],
            exclude_paths: Vec::new(),
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

/// Entry that could not be inspected
#[derive(Debug, Clone)]
pub struct WalkWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Result of a walk: regular files plus everything that was skipped with a reason
#[derive(Debug, Default)]
pub struct WalkReport {
    pub files: Vec<FileInfo>,
    pub symlinks_skipped: usize,
    pub warnings: Vec<WalkWarning>,
}

/// Walk a directory tree and collect all regular files.
///
/// Only a missing or unreadable root fails; everything below it degrades to
/// a warning in the report.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<WalkReport> {
    std::fs::read_dir(root)?;

    let mut report = WalkReport::default();

    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let entries = walker
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry, options));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                warn!(path = %path.display(), "Skipping unreadable entry: {}", e);
                report.warnings.push(WalkWarning { path, message: e.to_string() });
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            report.symlinks_skipped += 1;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        match entry.metadata() {
            Ok(metadata) => {
                let path = entry.path().to_path_buf();
                let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                report.files.push(FileInfo {
                    path,
                    relative_path,
                    size: metadata.len(),
                });
            }
            Err(e) => {
                warn!(path = %entry.path().display(), "Cannot read metadata: {}", e);
                report.warnings.push(WalkWarning {
                    path: entry.path().to_path_buf(),
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(report)
}

/// Check if a directory entry should be pruned from the walk
fn is_excluded(entry: &DirEntry, options: &WalkOptions) -> bool {
    if options.exclude_paths.iter().any(|p| p == entry.path()) {
        return true;
    }
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    options.exclude_dirs.iter().any(|d| d.as_str() == name)
}
