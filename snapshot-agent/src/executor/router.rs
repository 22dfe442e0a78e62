//! Chooses where a run's artifact goes.

use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::{Config, SyncMode};
use crate::utils::{logger::redact_url, EngineError, Result};

/// Exactly one destination per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local { dir: PathBuf },
    Git { work_dir: PathBuf },
    Api,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local { .. } => f.write_str("local"),
            Destination::Git { .. } => f.write_str("git"),
            Destination::Api => f.write_str("api"),
        }
    }
}

/// Why the configured remote cannot be used, if it cannot.
fn remote_unusable(config: &Config, mode: SyncMode) -> Option<&'static str> {
    let remote = &config.remote;
    if !remote.enabled {
        return Some("remote sync is disabled");
    }
    if remote.has_placeholder_credentials() {
        return Some("remote credentials are placeholders");
    }
    match mode {
        SyncMode::Api => {
            if !remote.provider.eq_ignore_ascii_case("github") {
                Some("api sync only supports the github provider")
            } else if remote.owner.is_empty() || remote.repo.is_empty() {
                Some("owner and repo are required for api sync")
            } else if remote.token.is_empty() {
                Some("a token is required for api sync")
            } else {
                None
            }
        }
        SyncMode::Git => {
            if remote.authenticated_url().is_none() {
                Some("no remote url, owner or repo configured")
            } else if config.work_dir_contains_project(&config.git_work_dir()) {
                Some("git work dir must not contain the project root")
            } else {
                None
            }
        }
    }
}

/// Pick the destination for a run.
///
/// `mode` overrides the configured remote mode. Falls back to local storage
/// when the remote is unusable; fails only when local storage is disabled too.
pub fn select(config: &Config, mode: Option<SyncMode>) -> Result<Destination> {
    let mode = mode.unwrap_or(config.remote.mode);

    let reason = match remote_unusable(config, mode) {
        None => {
            let destination = match mode {
                SyncMode::Git => Destination::Git {
                    work_dir: config.git_work_dir(),
                },
                SyncMode::Api => Destination::Api,
            };
            let target = config.remote_target();
            let url = config.remote.authenticated_url().unwrap_or_default();
            info!(
                destination = %destination,
                repository = %target.repository(),
                branch = %target.branch,
                remote = %redact_url(&url),
                "Routing backup to remote"
            );
            return Ok(destination);
        }
        Some(reason) => reason,
    };

    if config.storage.local.enabled {
        if config.remote.enabled {
            warn!("Remote unusable ({}), falling back to local storage", reason);
        }
        let dir = config.backup_dir();
        info!(destination = "local", dir = %dir.display(), "Routing backup to local storage");
        return Ok(Destination::Local { dir });
    }

    Err(EngineError::Config(format!(
        "No usable destination: local storage is disabled and {}",
        reason
    )))
}
