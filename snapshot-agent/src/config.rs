//! Configuration management for the snapshot agent.
//!
//! Loads configuration from a TOML file; secrets (remote token) may come from
//! the environment. A `Config` is built once per run and handed to the engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::{EngineError, Result};

/// Default git working copy, created inside the backup directory
pub const GIT_REPO_DIR: &str = ".snapshot-repo";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name, used as the backup id prefix
    #[serde(default = "default_project_name")]
    pub name: String,

    /// Project version recorded in the manifest
    #[serde(default = "default_project_version")]
    pub version: String,

    /// Root of the tree to snapshot
    #[serde(default = "default_project_root")]
    pub root: PathBuf,
}

/// File selection and classification rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Extensions (with leading dot) to include; empty includes everything
    #[serde(default = "default_include_extensions")]
    pub include_extensions: Vec<String>,

    /// Glob patterns on file names that are included regardless of extension
    #[serde(default = "default_include_names")]
    pub include_names: Vec<String>,

    /// Directory names that are never descended into
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,

    /// Glob patterns on file names that are always skipped
    #[serde(default = "default_exclude_names")]
    pub exclude_names: Vec<String>,

    /// Glob patterns (file name or relative path) marking a file sensitive
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,

    /// Path prefixes that are relocated inside the archive
    #[serde(default)]
    pub route_rewrites: Vec<RouteRewrite>,

    /// Per-file size ceiling in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Total file-count ceiling
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

/// Relocates files under `from` to `to` inside the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRewrite {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Environment variable holding the base64-encoded 32-byte key
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backup directory; relative paths resolve against the project root
    #[serde(default = "default_backup_path")]
    pub path: PathBuf,

    /// Number of backups retained after pruning
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Compressed format used when compression is enabled
    #[serde(default = "default_archive_format")]
    pub format: ArchiveFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "directory")]
    Directory,
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "tar.zst")]
    TarZst,
}

impl ArchiveFormat {
    /// File name suffix of the artifact, empty for plain directories
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Directory => "",
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::TarZst => ".tar.zst",
        }
    }

    /// Detect the format from an artifact file name.
    pub fn from_file_name(name: &str) -> Option<(Self, &str)> {
        [ArchiveFormat::TarGz, ArchiveFormat::TarZst]
            .into_iter()
            .find_map(|f| name.strip_suffix(f.extension()).map(|id| (f, id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Git,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Hard-reset to the remote tip before committing
    Override,
    /// Rebase-pull, continuing with local state on failure
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_sync_mode")]
    pub mode: SyncMode,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub repo: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Explicit remote URL; defaults to the provider's HTTPS clone URL
    #[serde(default)]
    pub url: Option<String>,

    /// Base URL of the provider's REST API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Access token; falls back to the `token_env` variable
    #[serde(default, skip_serializing)]
    pub token: String,

    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default)]
    pub commit_author: CommitAuthor,

    #[serde(default = "default_true")]
    pub sync_from_remote: bool,

    #[serde(default = "default_sync_policy")]
    pub policy: SyncPolicy,

    /// Permit a force-push when a push is rejected as non-fast-forward
    #[serde(default)]
    pub allow_force_push: bool,

    /// Working copy driven by the git engine; defaults to `<backup dir>/.snapshot-repo`.
    /// Must not be the project root or one of its parents.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Path prefix for files written through the object API
    #[serde(default)]
    pub path_prefix: String,

    /// Upper bound on concurrent blob uploads
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAuthor {
    #[serde(default = "default_author_name")]
    pub name: String,
    #[serde(default = "default_author_email")]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Local git commands (init, config, add, commit)
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Git fetch, pull and push
    #[serde(default = "default_network_secs")]
    pub network_secs: u64,

    /// Each HTTP request to the provider API
    #[serde(default = "default_http_secs")]
    pub http_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Remote destination resolved for one run. Never written into an artifact.
#[derive(Clone)]
pub struct RemoteSyncTarget {
    pub provider: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub credential: String,
    pub commit_author: CommitAuthor,
}

impl RemoteSyncTarget {
    /// `owner/repo`
    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Debug for RemoteSyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSyncTarget")
            .field("provider", &self.provider)
            .field("repository", &self.repository())
            .field("branch", &self.branch)
            .field("credential", &"<redacted>")
            .field("commit_author", &self.commit_author)
            .finish()
    }
}

/// Credential-free view of the configuration embedded in each manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub project_name: String,
    pub version: String,
    pub selection: SelectionConfig,
    pub archive_format: ArchiveFormat,
    pub encryption_algorithm: String,
}

// Default values
fn default_project_name() -> String {
    "project".to_string()
}

fn default_project_version() -> String {
    "1.0.0".to_string()
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_include_extensions() -> Vec<String> {
    to_strings(&[
        ".ts", ".tsx", ".js", ".jsx", ".json", ".md", ".yml", ".yaml", ".env", ".sql", ".prisma",
        ".rs", ".toml",
    ])
}

fn default_include_names() -> Vec<String> {
    to_strings(&["README", "Dockerfile", "Caddyfile", ".gitignore", "env.*"])
}

fn default_exclude_dirs() -> Vec<String> {
    to_strings(&[
        ".git", "node_modules", ".next", "dist", "build", ".vercel", "coverage", ".nyc_output",
        ".pytest_cache", "__pycache__", "target",
    ])
}

fn default_exclude_names() -> Vec<String> {
    to_strings(&[".DS_Store", "Thumbs.db", "*.log", "package-lock.json", "yarn.lock"])
}

fn default_sensitive_patterns() -> Vec<String> {
    to_strings(&[".env", ".env.*", "*.pem", "*.key", "*secret*", "*credentials*"])
}

fn default_max_file_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_max_files() -> usize {
    500
}

fn default_key_env() -> String {
    "BACKUP_ENCRYPTION_KEY".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("backups")
}

fn default_max_backups() -> usize {
    10
}

fn default_archive_format() -> ArchiveFormat {
    ArchiveFormat::TarGz
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Git
}

fn default_provider() -> String {
    "github".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_sync_policy() -> SyncPolicy {
    SyncPolicy::Override
}

fn default_max_concurrent_uploads() -> usize {
    8
}

fn default_author_name() -> String {
    "Snapshot Agent".to_string()
}

fn default_author_email() -> String {
    "backup@localhost".to_string()
}

fn default_command_secs() -> u64 {
    10
}

fn default_network_secs() -> u64 {
    30
}

fn default_http_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            version: default_project_version(),
            root: default_project_root(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            include_extensions: default_include_extensions(),
            include_names: default_include_names(),
            exclude_dirs: default_exclude_dirs(),
            exclude_names: default_exclude_names(),
            sensitive_patterns: default_sensitive_patterns(),
            route_rewrites: Vec::new(),
            max_file_size: default_max_file_size(),
            max_files: default_max_files(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { key_env: default_key_env() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local: LocalStorageConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_backup_path(),
            max_backups: default_max_backups(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: default_archive_format(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_sync_mode(),
            provider: default_provider(),
            owner: String::new(),
            repo: String::new(),
            branch: default_branch(),
            url: None,
            api_base_url: default_api_base_url(),
            token: String::new(),
            token_env: default_token_env(),
            commit_author: CommitAuthor::default(),
            sync_from_remote: true,
            policy: default_sync_policy(),
            allow_force_push: false,
            work_dir: None,
            path_prefix: String::new(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
        }
    }
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: default_author_name(),
            email: default_author_email(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            network_secs: default_network_secs(),
            http_secs: default_http_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            project: ProjectConfig::default(),
            selection: SelectionConfig::default(),
            encryption: EncryptionConfig::default(),
            storage: StorageConfig::default(),
            remote: RemoteConfig::default(),
            timeouts: TimeoutConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Fill secrets that were left out of the file from the environment.
    pub fn resolve_env(&mut self) {
        if self.remote.token.is_empty() {
            if let Ok(token) = std::env::var(&self.remote.token_env) {
                self.remote.token = token;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.local.max_backups == 0 {
            return Err(EngineError::Config("storage.local.max_backups must be at least 1".into()));
        }
        if self.selection.max_files == 0 {
            return Err(EngineError::Config("selection.max_files must be at least 1".into()));
        }
        if self.remote.max_concurrent_uploads == 0 {
            return Err(EngineError::Config(
                "remote.max_concurrent_uploads must be at least 1".into(),
            ));
        }
        for rewrite in &self.selection.route_rewrites {
            if crate::fs::classify::safe_relative_path(&rewrite.to).is_none()
                || crate::fs::classify::safe_relative_path(&rewrite.from).is_none()
            {
                return Err(EngineError::Config(format!(
                    "Route rewrite {} -> {} must stay inside the project",
                    rewrite.from, rewrite.to
                )));
            }
        }
        Ok(())
    }

    /// Project root as an absolute path when it can be resolved
    pub fn project_root(&self) -> PathBuf {
        std::fs::canonicalize(&self.project.root).unwrap_or_else(|_| self.project.root.clone())
    }

    /// Local backup directory, resolved against the project root
    pub fn backup_dir(&self) -> PathBuf {
        if self.storage.local.path.is_absolute() {
            self.storage.local.path.clone()
        } else {
            self.project_root().join(&self.storage.local.path)
        }
    }

    /// Working copy for the git engine. Defaults to a hidden repository
    /// inside the backup directory, which selection and retention both skip.
    pub fn git_work_dir(&self) -> PathBuf {
        match &self.remote.work_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_root().join(dir),
            None => self.backup_dir().join(GIT_REPO_DIR),
        }
    }

    /// True when `work_dir` is the project root or one of its ancestors.
    pub fn work_dir_contains_project(&self, work_dir: &Path) -> bool {
        let work_dir = std::fs::canonicalize(work_dir).unwrap_or_else(|_| work_dir.to_path_buf());
        self.project_root().starts_with(work_dir)
    }

    pub fn archive_format(&self) -> ArchiveFormat {
        if self.storage.compression.enabled {
            self.storage.compression.format
        } else {
            ArchiveFormat::Directory
        }
    }

    /// Remote settings for one run, with the resolved credential
    pub fn remote_target(&self) -> RemoteSyncTarget {
        RemoteSyncTarget {
            provider: self.remote.provider.clone(),
            owner: self.remote.owner.clone(),
            repo: self.remote.repo.clone(),
            branch: self.remote.branch.clone(),
            credential: self.remote.token.clone(),
            commit_author: self.remote.commit_author.clone(),
        }
    }

    /// Snapshot written into the manifest; carries no remote settings or secrets.
    pub fn redacted_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            project_name: self.project.name.clone(),
            version: self.project.version.clone(),
            selection: self.selection.clone(),
            archive_format: self.archive_format(),
            encryption_algorithm: crate::crypto::ALGORITHM.to_string(),
        }
    }
}

impl RemoteConfig {
    /// True when the credentials are sample values copied from documentation.
    pub fn has_placeholder_credentials(&self) -> bool {
        self.token == "demo-token"
            || self.token.contains("your-personal-access-token")
            || self.owner == "demo-user"
            || self.owner.contains("your-username")
            || self.repo == "demo-repo"
            || self.repo.contains("your-repo-name")
    }

    /// Remote URL for the git engine with the credential embedded.
    pub fn authenticated_url(&self) -> Option<String> {
        let base = match &self.url {
            Some(url) => url.clone(),
            None if !self.owner.is_empty() && !self.repo.is_empty() => {
                format!("https://github.com/{}/{}.git", self.owner, self.repo)
            }
            None => return None,
        };

        if self.token.is_empty() {
            return Some(base);
        }
        match base.strip_prefix("https://") {
            Some(rest) if !rest.contains('@') => Some(format!("https://{}@{}", self.token, rest)),
            _ => Some(base),
        }
    }
}
