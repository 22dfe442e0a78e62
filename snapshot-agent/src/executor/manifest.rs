//! Backup manifest written as `backup-metadata.json` at the root of each artifact.
//!
//! The manifest is created once per run and never modified afterwards. It
//! carries a credential-free configuration snapshot so an artifact can be
//! inspected without the configuration that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{Config, ConfigSnapshot};
use crate::utils::Result;

/// File name of the manifest inside an artifact
pub const MANIFEST_FILE: &str = "backup-metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub id: String,
    pub project_name: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub platform: String,
    pub stats: ManifestStats,
    pub config: ConfigSnapshot,
}

/// File counts per classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub regular_count: usize,
    #[serde(default)]
    pub route_special_count: usize,
    pub encrypted_count: usize,
}

impl BackupManifest {
    pub fn new(id: &str, timestamp: DateTime<Utc>, config: &Config, stats: ManifestStats) -> Self {
        Self {
            id: id.to_string(),
            project_name: config.project.name.clone(),
            version: config.project.version.clone(),
            timestamp,
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            stats,
            config: config.redacted_snapshot(),
        }
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        Self::from_slice(&std::fs::read(dir.join(MANIFEST_FILE))?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
