//! File selection and classification.
//!
//! Partitions the project tree into Regular, Sensitive and RouteSpecial files.
//! Every selected file lands in exactly one partition: sensitivity is checked
//! first, then route rewrites, and everything else is Regular. Files that
//! cannot be read or break a ceiling are reported, never fatal.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::walker::{walk_directory, FileInfo, WalkOptions};
use crate::config::{RouteRewrite, SelectionConfig};
use crate::utils::{EngineError, ErrorKind, FileIssue, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Regular,
    Sensitive,
    RouteSpecial,
}

/// A selected file, scoped to one run.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Absolute path in the source tree
    pub source: PathBuf,

    /// Path relative to the project root
    pub relative_path: PathBuf,

    /// Path inside the artifact (rewritten for RouteSpecial files)
    pub archive_path: PathBuf,

    pub classification: Classification,

    pub size: u64,
}

/// Output of a classification pass
#[derive(Debug, Default)]
pub struct Partition {
    pub regular: Vec<FileRecord>,
    pub sensitive: Vec<FileRecord>,
    pub route_special: Vec<FileRecord>,
    /// Files excluded by a ceiling or an unreadable entry
    pub issues: Vec<FileIssue>,
}

impl Partition {
    pub fn total_selected(&self) -> usize {
        self.regular.len() + self.sensitive.len() + self.route_special.len()
    }

    /// Regular and RouteSpecial files, which are copied verbatim
    pub fn plain_files(&self) -> impl Iterator<Item = &FileRecord> {
        self.regular.iter().chain(self.route_special.iter())
    }
}

/// Compiled selection rules
#[derive(Debug, Clone)]
pub struct Classifier {
    include_extensions: Vec<String>,
    include_names: Vec<Pattern>,
    exclude_names: Vec<Pattern>,
    sensitive: Vec<Pattern>,
    rewrites: Vec<(PathBuf, PathBuf)>,
    max_file_size: u64,
    max_files: usize,
    walk_options: WalkOptions,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| EngineError::Config(format!("Invalid pattern '{}': {}", p, e)))
        })
        .collect()
}

impl Classifier {
    /// Build a classifier; `exclude_paths` are absolute paths pruned from the walk.
    pub fn new(rules: &SelectionConfig, exclude_paths: Vec<PathBuf>) -> Result<Self> {
        let rewrites = rules
            .route_rewrites
            .iter()
            .map(|RouteRewrite { from, to }| {
                match (safe_relative_path(from), safe_relative_path(to)) {
                    (Some(from), Some(to)) => Ok((from, to)),
                    _ => Err(EngineError::Config(format!(
                        "Route rewrite {} -> {} must stay inside the project",
                        from, to
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let exclude_paths = exclude_paths
            .into_iter()
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
            .collect();

        Ok(Self {
            include_extensions: rules.include_extensions.clone(),
            include_names: compile(&rules.include_names)?,
            exclude_names: compile(&rules.exclude_names)?,
            sensitive: compile(&rules.sensitive_patterns)?,
            rewrites,
            max_file_size: rules.max_file_size,
            max_files: rules.max_files,
            walk_options: WalkOptions {
                max_depth: None,
                exclude_dirs: rules.exclude_dirs.clone(),
                exclude_paths,
            },
        })
    }

    /// Classify a single relative path. `None` means the rules do not select it.
    pub fn classify_path(&self, relative: &Path) -> Option<(Classification, PathBuf)> {
        let name = relative.file_name()?.to_string_lossy();
        let slash_path = to_slash(relative);

        if self.exclude_names.iter().any(|p| p.matches(&name)) {
            return None;
        }

        if self
            .sensitive
            .iter()
            .any(|p| p.matches(&name) || p.matches(&slash_path))
        {
            return Some((Classification::Sensitive, relative.to_path_buf()));
        }

        if !self.is_included(relative, &name) {
            return None;
        }

        for (from, to) in &self.rewrites {
            if let Ok(rest) = relative.strip_prefix(from) {
                return Some((Classification::RouteSpecial, to.join(rest)));
            }
        }

        Some((Classification::Regular, relative.to_path_buf()))
    }

    fn is_included(&self, relative: &Path, name: &str) -> bool {
        if self.include_extensions.is_empty() {
            return true;
        }
        if self.include_names.iter().any(|p| p.matches(name)) {
            return true;
        }
        relative
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .map(|ext| self.include_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
            .unwrap_or(false)
    }

    /// Walk `root` and partition every selected file.
    ///
    /// Fails only when the root itself cannot be read.
    pub fn partition(&self, root: &Path) -> Result<Partition> {
        let report = walk_directory(root, &self.walk_options)?;
        let mut partition = Partition::default();

        for warning in report.warnings {
            partition.issues.push(FileIssue::new(
                warning.path.to_string_lossy(),
                ErrorKind::PartialFailure,
                format!("unreadable: {}", warning.message),
            ));
        }
        if report.symlinks_skipped > 0 {
            debug!("Skipped {} symlinks", report.symlinks_skipped);
        }

        let mut truncated = 0usize;
        for FileInfo { path, relative_path, size } in report.files {
            let Some((classification, archive_path)) = self.classify_path(&relative_path) else {
                continue;
            };

            if size > self.max_file_size {
                warn!(path = %relative_path.display(), size, "Skipping file above size ceiling");
                partition.issues.push(FileIssue::new(
                    to_slash(&relative_path),
                    ErrorKind::PartialFailure,
                    format!("{} bytes exceeds the {} byte ceiling", size, self.max_file_size),
                ));
                continue;
            }

            if partition.total_selected() >= self.max_files {
                truncated += 1;
                partition.issues.push(FileIssue::new(
                    to_slash(&relative_path),
                    ErrorKind::PartialFailure,
                    format!("file-count ceiling of {} reached", self.max_files),
                ));
                continue;
            }

            let record = FileRecord {
                source: path,
                relative_path,
                archive_path,
                classification,
                size,
            };
            match classification {
                Classification::Regular => partition.regular.push(record),
                Classification::Sensitive => partition.sensitive.push(record),
                Classification::RouteSpecial => partition.route_special.push(record),
            }
        }

        if truncated > 0 {
            warn!(
                "Reached maximum file limit ({}), skipped {} remaining files",
                self.max_files, truncated
            );
        }

        info!(
            regular = partition.regular.len(),
            sensitive = partition.sensitive.len(),
            route_special = partition.route_special.len(),
            skipped = partition.issues.len(),
            "Classified project files"
        );

        Ok(partition)
    }
}

/// Normalize a relative path, rejecting anything that could leave its root.
///
/// Returns `None` for absolute paths, `..` components and empty paths.
pub fn safe_relative_path(path: impl AsRef<Path>) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Relative path with `/` separators, as stored in manifests and trees
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn classifier(rules: SelectionConfig) -> Classifier {
        Classifier::new(&rules, Vec::new()).unwrap()
    }

    #[test]
    fn test_sensitive_wins_over_include() {
        let c = classifier(SelectionConfig::default());
        let (class, path) = c.classify_path(Path::new(".env")).unwrap();
        assert_eq!(class, Classification::Sensitive);
        assert_eq!(path, PathBuf::from(".env"));

        let (class, _) = c.classify_path(Path::new("config/.env.production")).unwrap();
        assert_eq!(class, Classification::Sensitive);
    }

    #[test]
    fn test_extension_and_name_rules() {
        let c = classifier(SelectionConfig::default());
        assert_eq!(
            c.classify_path(Path::new("src/app/page.tsx")).map(|r| r.0),
            Some(Classification::Regular)
        );
        assert_eq!(
            c.classify_path(Path::new("Dockerfile")).map(|r| r.0),
            Some(Classification::Regular)
        );
        assert!(c.classify_path(Path::new("logo.png")).is_none());
        assert!(c.classify_path(Path::new("server.log")).is_none());
    }

    #[test]
    fn test_route_rewrite() {
        let rules = SelectionConfig {
            route_rewrites: vec![RouteRewrite {
                from: "src/app/api".into(),
                to: "api-routes".into(),
            }],
            ..SelectionConfig::default()
        };
        let c = classifier(rules);
        let (class, path) = c.classify_path(Path::new("src/app/api/github/route.ts")).unwrap();
        assert_eq!(class, Classification::RouteSpecial);
        assert_eq!(path, PathBuf::from("api-routes/github/route.ts"));
    }

    #[test]
    fn test_partition_is_disjoint() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("src/app/api"))?;
        fs::write(root.join("README.md"), b"# readme")?;
        fs::write(root.join("src/index.ts"), b"export {}")?;
        fs::write(root.join("src/app/api/route.ts"), b"export {}")?;
        fs::write(root.join(".env"), b"SECRET=1")?;

        let rules = SelectionConfig {
            route_rewrites: vec![RouteRewrite {
                from: "src/app/api".into(),
                to: "routes".into(),
            }],
            ..SelectionConfig::default()
        };
        let partition = classifier(rules).partition(root)?;

        assert_eq!(partition.regular.len(), 2);
        assert_eq!(partition.sensitive.len(), 1);
        assert_eq!(partition.route_special.len(), 1);

        let mut all: Vec<_> = partition
            .regular
            .iter()
            .chain(&partition.sensitive)
            .chain(&partition.route_special)
            .map(|r| r.relative_path.clone())
            .collect();
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), before);

        Ok(())
    }

    #[test]
    fn test_size_ceiling_skips_with_issue() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("big.json"), vec![b'x'; 64])?;
        fs::write(temp_dir.path().join("small.json"), b"{}")?;

        let rules = SelectionConfig {
            max_file_size: 16,
            ..SelectionConfig::default()
        };
        let partition = classifier(rules).partition(temp_dir.path())?;

        assert_eq!(partition.regular.len(), 1);
        assert_eq!(partition.issues.len(), 1);
        assert_eq!(partition.issues[0].path, "big.json");
        assert_eq!(partition.issues[0].kind, ErrorKind::PartialFailure);

        Ok(())
    }

    #[test]
    fn test_count_ceiling_truncates_deterministically() -> Result<()> {
        let temp_dir = TempDir::new()?;
        for name in ["d.md", "b.md", "a.md", "c.md"] {
            fs::write(temp_dir.path().join(name), name)?;
        }

        let rules = SelectionConfig {
            max_files: 2,
            ..SelectionConfig::default()
        };
        let partition = classifier(rules).partition(temp_dir.path())?;

        let kept: Vec<_> = partition.regular.iter().map(|r| to_slash(&r.relative_path)).collect();
        assert_eq!(kept, vec!["a.md", "b.md"]);
        assert_eq!(partition.issues.len(), 2);

        Ok(())
    }

    #[test]
    fn test_safe_relative_path() {
        assert_eq!(safe_relative_path("a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(safe_relative_path("../etc/passwd"), None);
        assert_eq!(safe_relative_path("/etc/passwd"), None);
        assert_eq!(safe_relative_path(""), None);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let rules = SelectionConfig {
            sensitive_patterns: vec!["[".into()],
            ..SelectionConfig::default()
        };
        assert!(matches!(
            Classifier::new(&rules, Vec::new()),
            Err(EngineError::Config(_))
        ));
    }
}
