//! Artifact staging and packaging.
//!
//! A run stages its files into a hidden temp directory next to the final
//! location, then publishes the artifact with a single rename. Nothing is
//! visible under `<backupId>` or `<backupId>.tar.gz` until it is complete.

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::manifest::{BackupManifest, ManifestStats, MANIFEST_FILE};
use crate::config::{ArchiveFormat, Config};
use crate::crypto::{EncryptionManager, ENCRYPTED_SUFFIX};
use crate::fs::classify::{safe_relative_path, to_slash, FileRecord, Partition};
use crate::fs::metadata::ArtifactMetadata;
use crate::utils::{EngineError, ErrorKind, FileIssue, Result};

/// Directory names never written into an artifact
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// zstd level used for `.tar.zst` artifacts
const ZSTD_LEVEL: i32 = 3;

/// A finished backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    pub id: String,
    pub path: PathBuf,
    pub format: ArchiveFormat,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Files staged for one run, removed on drop unless published
#[derive(Debug)]
pub struct StagedBackup {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub manifest: BackupManifest,
    pub issues: Vec<FileIssue>,
    dir: TempDir,
}

impl StagedBackup {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn stats(&self) -> ManifestStats {
        self.manifest.stats
    }

    /// Relative paths of every staged file, sorted
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(self.path())
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.path().strip_prefix(self.path()).ok().map(Path::to_path_buf))
            .filter(|p| !is_vcs_path(p))
            .collect();
        files.sort();
        files
    }
}

/// Build a backup id: `<project>-<UTC timestamp>-<8 hex>`
pub fn generate_backup_id(project: &str, timestamp: DateTime<Utc>) -> String {
    let project: String = project
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let stamp = timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", project, stamp, &suffix[..8])
}

fn is_vcs_path(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => VCS_DIRS.iter().any(|vcs| name == *vcs),
        _ => false,
    })
}

/// Stage regular files, encrypted payloads and the manifest under `parent`.
///
/// Per-file failures become issues on the returned stage; only failing to
/// create the staging directory or write the manifest is an error.
pub fn stage(
    parent: &Path,
    id: &str,
    created_at: DateTime<Utc>,
    config: &Config,
    partition: &Partition,
    encryption: Option<&EncryptionManager>,
) -> Result<StagedBackup> {
    fs::create_dir_all(parent)?;
    let dir = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(parent)?;
    let root = dir.path();

    let mut issues = Vec::new();
    let mut written: HashSet<PathBuf> = HashSet::new();
    let mut stats = ManifestStats::default();

    for record in partition.plain_files() {
        let Some(target) = claim_path(&record.archive_path, &mut written, &mut issues, record) else {
            continue;
        };
        match copy_into(root, &target, &record.source) {
            Ok(()) => {
                if record.archive_path == record.relative_path {
                    stats.regular_count += 1;
                } else {
                    stats.route_special_count += 1;
                }
            }
            Err(e) => {
                warn!(path = %record.relative_path.display(), "Failed to copy file: {}", e);
                issues.push(FileIssue::from_error(to_slash(&record.relative_path), &e));
            }
        }
    }

    for record in &partition.sensitive {
        let Some(manager) = encryption else {
            warn!(path = %record.relative_path.display(), "No encryption key, excluding sensitive file");
            issues.push(FileIssue::new(
                to_slash(&record.relative_path),
                ErrorKind::Configuration,
                "sensitive file excluded: no encryption key configured",
            ));
            continue;
        };

        let mut encrypted = record.archive_path.clone().into_os_string();
        encrypted.push(ENCRYPTED_SUFFIX);
        let encrypted = PathBuf::from(encrypted);

        let Some(target) = claim_path(&encrypted, &mut written, &mut issues, record) else {
            continue;
        };
        let dest = root.join(&target);
        let result = ensure_parent(&dest).and_then(|_| manager.encrypt_file(&record.source, &dest));
        match result {
            Ok(()) => stats.encrypted_count += 1,
            Err(e) => {
                warn!(path = %record.relative_path.display(), "Failed to encrypt file: {}", e);
                let _ = fs::remove_file(&dest);
                issues.push(FileIssue::from_error(to_slash(&record.relative_path), &e));
            }
        }
    }

    let manifest = BackupManifest::new(id, created_at, config, stats);
    manifest.write_to(root)?;

    debug!(
        backup_id = %id,
        regular = stats.regular_count,
        route_special = stats.route_special_count,
        encrypted = stats.encrypted_count,
        "Staged backup"
    );

    Ok(StagedBackup {
        id: id.to_string(),
        created_at,
        manifest,
        issues,
        dir,
    })
}

/// Reserve an artifact path, rejecting unsafe paths and collisions.
fn claim_path(
    path: &Path,
    written: &mut HashSet<PathBuf>,
    issues: &mut Vec<FileIssue>,
    record: &FileRecord,
) -> Option<PathBuf> {
    let reason = match safe_relative_path(path) {
        None => "path would leave the backup root",
        Some(p) if p == Path::new(MANIFEST_FILE) || is_vcs_path(&p) => "path is reserved",
        Some(p) if !written.insert(p.clone()) => "another file already uses this path",
        Some(p) => return Some(p),
    };
    warn!(path = %record.relative_path.display(), "Skipping file: {}", reason);
    issues.push(FileIssue::new(
        to_slash(&record.relative_path),
        ErrorKind::PartialFailure,
        reason,
    ));
    None
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn copy_into(root: &Path, relative: &Path, source: &Path) -> Result<()> {
    let dest = root.join(relative);
    ensure_parent(&dest)?;
    fs::copy(source, &dest)?;
    Ok(())
}

/// Publish a staged backup into `dest_dir` with a single rename.
///
/// For `Directory` the stage must live inside `dest_dir`; compressed formats
/// are written to a hidden temp file in `dest_dir` and persisted atomically.
pub fn finalize(staged: StagedBackup, dest_dir: &Path, format: ArchiveFormat) -> Result<Archive> {
    fs::create_dir_all(dest_dir)?;
    let final_path = dest_dir.join(format!("{}{}", staged.id, format.extension()));
    if final_path.exists() {
        return Err(EngineError::Archive(format!(
            "Artifact already exists: {}",
            final_path.display()
        )));
    }

    let StagedBackup { id, created_at, dir, .. } = staged;

    match format {
        ArchiveFormat::Directory => {
            let staging = dir.keep();
            if let Err(e) = fs::rename(&staging, &final_path) {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
        }
        ArchiveFormat::TarGz | ArchiveFormat::TarZst => {
            let mut partial = tempfile::Builder::new()
                .prefix(".partial-")
                .suffix(format.extension())
                .tempfile_in(dest_dir)?;

            write_tar(partial.as_file_mut(), &id, dir.path(), format)?;
            partial.as_file().sync_all()?;
            partial
                .persist_noclobber(&final_path)
                .map_err(|e| EngineError::Io(e.error))?;
            // staging dir is removed when `dir` drops
        }
    }

    let size_bytes = ArtifactMetadata::from_path(&final_path)
        .map(|m| m.size)
        .unwrap_or_default();

    info!(backup_id = %id, path = %final_path.display(), size_bytes, "Backup artifact published");

    Ok(Archive {
        id,
        path: final_path,
        format,
        size_bytes,
        created_at,
    })
}

fn write_tar(out: &mut File, id: &str, source: &Path, format: ArchiveFormat) -> Result<()> {
    match format {
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(out, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_tree(&mut builder, id, source)?;
            builder.into_inner()?.finish()?;
        }
        ArchiveFormat::TarZst => {
            let encoder = zstd::Encoder::new(out, ZSTD_LEVEL)?;
            let mut builder = tar::Builder::new(encoder);
            append_tree(&mut builder, id, source)?;
            builder.into_inner()?.finish()?;
        }
        ArchiveFormat::Directory => {
            return Err(EngineError::Archive("Directory artifacts are not tarred".into()));
        }
    }
    Ok(())
}

/// Append every file below `source` as `<id>/<relative path>`, in sorted order.
fn append_tree<W: Write>(builder: &mut tar::Builder<W>, id: &str, source: &Path) -> Result<()> {
    let walker = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !VCS_DIRS.iter().any(|vcs| e.file_name() == *vcs));

    for entry in walker {
        let entry = entry.map_err(|e| EngineError::Archive(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .ok()
            .and_then(safe_relative_path)
            .ok_or_else(|| {
                EngineError::Archive(format!("Unsafe archive path: {}", entry.path().display()))
            })?;
        builder.append_path_with_name(entry.path(), Path::new(id).join(relative))?;
    }
    Ok(())
}

fn open_tar(path: &Path, format: ArchiveFormat) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarZst => Box::new(zstd::Decoder::new(file)?),
        ArchiveFormat::Directory => {
            return Err(EngineError::Archive(format!("{} is not a tar archive", path.display())))
        }
    };
    Ok(tar::Archive::new(reader))
}

/// Entry path with the leading `<id>/` removed, if it is safe to extract.
fn entry_relative_path(raw: &Path) -> Option<PathBuf> {
    let safe = safe_relative_path(raw)?;
    let mut components = safe.components();
    components.next()?;
    safe_relative_path(components.as_path())
}

/// Read the manifest of a published artifact without extracting it.
pub fn read_manifest(path: &Path, format: ArchiveFormat) -> Result<BackupManifest> {
    if format == ArchiveFormat::Directory {
        return BackupManifest::read_from(path);
    }

    let mut archive = open_tar(path, format)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        if entry_relative_path(&raw).as_deref() == Some(Path::new(MANIFEST_FILE)) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return BackupManifest::from_slice(&bytes);
        }
    }
    Err(EngineError::NotFound(format!("{} has no manifest", path.display())))
}

/// Extract an artifact's files (manifest excluded) into `target`.
///
/// Returns the relative paths written. Entries that would land outside
/// `target` or inside version-control metadata are skipped with an issue.
pub fn unpack(
    path: &Path,
    format: ArchiveFormat,
    target: &Path,
    issues: &mut Vec<FileIssue>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(target)?;
    let mut written = Vec::new();

    if format == ArchiveFormat::Directory {
        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| EngineError::Archive(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = entry.path().strip_prefix(path).ok().and_then(safe_relative_path)
            else {
                continue;
            };
            if relative == Path::new(MANIFEST_FILE) || is_vcs_path(&relative) {
                continue;
            }
            let dest = target.join(&relative);
            ensure_parent(&dest)?;
            fs::copy(entry.path(), &dest)?;
            written.push(relative);
        }
        return Ok(written);
    }

    let mut archive = open_tar(path, format)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry.path()?.into_owned();
        let Some(relative) = entry_relative_path(&raw) else {
            warn!(entry = %raw.display(), "Refusing to extract unsafe archive entry");
            issues.push(FileIssue::new(
                raw.to_string_lossy(),
                ErrorKind::Integrity,
                "archive entry escapes the restore root",
            ));
            continue;
        };
        if relative == Path::new(MANIFEST_FILE) || is_vcs_path(&relative) {
            continue;
        }
        let dest = target.join(&relative);
        ensure_parent(&dest)?;
        entry.unpack(&dest)?;
        written.push(relative);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionConfig;
    use crate::crypto::EncryptionKey;
    use crate::fs::classify::Classifier;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("README.md"), b"# demo").unwrap();
        fs::write(root.join("package.json"), b"{}").unwrap();
        fs::write(root.join("src/index.ts"), b"export const a = 1;").unwrap();
        fs::write(root.join(".env"), b"DB_PASSWORD=plaintext-secret").unwrap();
        fs::write(root.join(".git/HEAD"), b"ref: refs/heads/main").unwrap();
        dir
    }

    fn partition(root: &Path) -> Partition {
        Classifier::new(&SelectionConfig::default(), Vec::new())
            .unwrap()
            .partition(root)
            .unwrap()
    }

    fn tar_entries(path: &Path, format: ArchiveFormat) -> Vec<(PathBuf, Vec<u8>)> {
        let mut archive = open_tar(path, format).unwrap();
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let path = e.path().unwrap().into_owned();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (path, data)
            })
            .collect()
    }

    #[test]
    fn test_backup_id_format() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = generate_backup_id("my app", ts);
        assert!(id.starts_with("my-app-2026-01-02T03-04-05-678Z-"));
        assert_eq!(id.len(), "my-app-2026-01-02T03-04-05-678Z-".len() + 8);
        assert_ne!(id, generate_backup_id("my app", ts));
    }

    #[test]
    fn test_tar_gz_is_complete_and_safe() -> Result<()> {
        let src = project();
        let out = TempDir::new()?;
        let manager = EncryptionManager::new(&EncryptionKey::generate());
        let config = Config::default();

        let staged = stage(
            out.path(),
            "demo-1",
            Utc::now(),
            &config,
            &partition(src.path()),
            Some(&manager),
        )?;
        assert_eq!(staged.stats().regular_count, 3);
        assert_eq!(staged.stats().encrypted_count, 1);
        assert!(staged.issues.is_empty());

        let archive = finalize(staged, out.path(), ArchiveFormat::TarGz)?;
        assert_eq!(archive.path, out.path().join("demo-1.tar.gz"));

        let entries = tar_entries(&archive.path, ArchiveFormat::TarGz);
        let names: Vec<String> = entries.iter().map(|(p, _)| to_slash(p)).collect();
        assert!(names.contains(&"demo-1/.env.encrypted".to_string()));
        assert!(names.contains(&"demo-1/backup-metadata.json".to_string()));
        assert!(names.contains(&"demo-1/src/index.ts".to_string()));
        assert!(!names.iter().any(|n| n.contains(".git/")));
        assert!(!names.contains(&"demo-1/.env".to_string()));

        for (path, data) in &entries {
            assert!(path.starts_with("demo-1"));
            assert!(safe_relative_path(path).is_some());
            assert!(!String::from_utf8_lossy(data).contains("plaintext-secret"));
        }

        // only the artifact is left behind
        let leftovers: Vec<_> = fs::read_dir(out.path())?.collect();
        assert_eq!(leftovers.len(), 1);

        Ok(())
    }

    #[test]
    fn test_sensitive_excluded_without_key() -> Result<()> {
        let src = project();
        let out = TempDir::new()?;
        let staged = stage(
            out.path(),
            "demo-2",
            Utc::now(),
            &Config::default(),
            &partition(src.path()),
            None,
        )?;

        assert_eq!(staged.stats().encrypted_count, 0);
        assert_eq!(staged.issues.len(), 1);
        assert_eq!(staged.issues[0].path, ".env");
        assert!(!staged.path().join(".env").exists());
        assert!(!staged.path().join(".env.encrypted").exists());

        Ok(())
    }

    #[test]
    fn test_directory_format_and_manifest_lookup() -> Result<()> {
        let src = project();
        let out = TempDir::new()?;
        let manager = EncryptionManager::new(&EncryptionKey::generate());
        let staged = stage(
            out.path(),
            "demo-3",
            Utc::now(),
            &Config::default(),
            &partition(src.path()),
            Some(&manager),
        )?;
        let staging_path = staged.path().to_path_buf();

        let archive = finalize(staged, out.path(), ArchiveFormat::Directory)?;
        assert!(!staging_path.exists());
        assert!(archive.path.join("README.md").is_file());

        let manifest = read_manifest(&archive.path, ArchiveFormat::Directory)?;
        assert_eq!(manifest.id, "demo-3");

        Ok(())
    }

    #[test]
    fn test_unpack_zst_skips_manifest() -> Result<()> {
        let src = project();
        let out = TempDir::new()?;
        let staged = stage(
            out.path(),
            "demo-4",
            Utc::now(),
            &Config::default(),
            &partition(src.path()),
            None,
        )?;
        let archive = finalize(staged, out.path(), ArchiveFormat::TarZst)?;
        assert_eq!(read_manifest(&archive.path, ArchiveFormat::TarZst)?.id, "demo-4");

        let target = TempDir::new()?;
        let mut issues = Vec::new();
        let written = unpack(&archive.path, ArchiveFormat::TarZst, target.path(), &mut issues)?;

        assert_eq!(written.len(), 3);
        assert!(issues.is_empty());
        assert_eq!(fs::read(target.path().join("src/index.ts"))?, b"export const a = 1;");
        assert!(!target.path().join(MANIFEST_FILE).exists());

        Ok(())
    }
}
