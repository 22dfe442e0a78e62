//! GitHub git-object API client.
//!
//! Wraps `reqwest::Client` with bearer authentication and a per-request
//! timeout. Only the six calls needed to build a commit without a working
//! copy are implemented.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::CommitAuthor;
use crate::utils::{EngineError, Result};

const USER_AGENT: &str = concat!("snapshot-agent/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";

/// One entry of a tree-create request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
}

impl TreeEntry {
    /// Regular (non-executable) file blob
    pub fn blob(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: "100644".to_string(),
            kind: "blob".to_string(),
            sha: sha.into(),
        }
    }
}

/// A named ref and the commit it points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitObjectRef {
    pub ref_name: String,
    pub commit_sha: String,
}

impl GitObjectRef {
    /// `refs/heads/<branch>` at `commit_sha`
    pub fn branch(branch: &str, commit_sha: impl Into<String>) -> Self {
        Self {
            ref_name: format!("refs/heads/{}", branch),
            commit_sha: commit_sha.into(),
        }
    }
}

/// Content-addressed object store behind a branch
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Commit sha the branch points at
    async fn get_ref(&self, branch: &str) -> Result<String>;

    /// Tree sha of a commit
    async fn get_commit_tree(&self, commit_sha: &str) -> Result<String>;

    async fn create_blob(&self, content: &[u8]) -> Result<String>;

    /// New tree layered on `base_tree`
    async fn create_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String>;

    async fn create_commit(
        &self,
        message: &str,
        tree_sha: &str,
        parents: &[String],
        author: &CommitAuthor,
    ) -> Result<String>;

    /// Move the branch to `commit_sha`; fast-forward only
    async fn update_ref(&self, branch: &str, commit_sha: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaResponse,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    tree: ShaResponse,
}

/// HTTP client for one repository
pub struct GitHubClient {
    client: Client,
    base_url: String,
    owner: String,
    repo: String,
    token: String,
}

impl GitHubClient {
    /// Client against `base_url` (`remote.api_base_url`: github.com, Enterprise, tests)
    pub fn with_base_url(
        base_url: impl Into<String>,
        owner: &str,
        repo: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/repos/{}/{}/git{}", self.base_url, self.owner, self.repo, path);
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Send and map transport failures; timeouts become `EngineError::Timeout`.
    async fn send(&self, what: &str, request: RequestBuilder) -> Result<Response> {
        debug!(call = what, "GitHub API request");
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(format!("{} timed out", what))
            } else {
                EngineError::Network(format!("{}: {}", what, e))
            }
        })
    }

    async fn parse<T: serde::de::DeserializeOwned>(&self, what: &str, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(what, status, &body));
        }
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(format!("{} timed out", what))
            } else {
                EngineError::Api(format!("{}: unexpected response: {}", what, e))
            }
        })
    }
}

fn status_error(what: &str, status: StatusCode, body: &str) -> EngineError {
    let message = format!("{} returned HTTP {}: {}", what, status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            EngineError::RepositoryAccess(message)
        }
        StatusCode::TOO_MANY_REQUESTS => EngineError::Network(message),
        s if s.is_server_error() => EngineError::Network(message),
        _ => EngineError::Api(message),
    }
}

#[async_trait]
impl ObjectStore for GitHubClient {
    async fn get_ref(&self, branch: &str) -> Result<String> {
        let response = self
            .send("get ref", self.request(Method::GET, &format!("/ref/heads/{}", branch)))
            .await?;
        let reference: RefResponse = self.parse("get ref", response).await?;
        Ok(reference.object.sha)
    }

    async fn get_commit_tree(&self, commit_sha: &str) -> Result<String> {
        let response = self
            .send("get commit", self.request(Method::GET, &format!("/commits/{}", commit_sha)))
            .await?;
        let commit: CommitResponse = self.parse("get commit", response).await?;
        Ok(commit.tree.sha)
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String> {
        let body = json!({
            "content": STANDARD.encode(content),
            "encoding": "base64",
        });
        let response = self
            .send("create blob", self.request(Method::POST, "/blobs").json(&body))
            .await?;
        let blob: ShaResponse = self.parse("create blob", response).await?;
        Ok(blob.sha)
    }

    async fn create_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String> {
        let body = json!({
            "base_tree": base_tree,
            "tree": entries,
        });
        let response = self
            .send("create tree", self.request(Method::POST, "/trees").json(&body))
            .await?;
        let tree: ShaResponse = self.parse("create tree", response).await?;
        Ok(tree.sha)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree_sha: &str,
        parents: &[String],
        author: &CommitAuthor,
    ) -> Result<String> {
        let body = json!({
            "message": message,
            "tree": tree_sha,
            "parents": parents,
            "author": {
                "name": author.name,
                "email": author.email,
                "date": Utc::now().to_rfc3339(),
            },
        });
        let response = self
            .send("create commit", self.request(Method::POST, "/commits").json(&body))
            .await?;
        let commit: ShaResponse = self.parse("create commit", response).await?;
        Ok(commit.sha)
    }

    async fn update_ref(&self, branch: &str, commit_sha: &str) -> Result<()> {
        let body = json!({ "sha": commit_sha, "force": false });
        let response = self
            .send(
                "update ref",
                self.request(Method::PATCH, &format!("/refs/heads/{}", branch)).json(&body),
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::CONFLICT {
            return Err(EngineError::RefUpdate(format!(
                "{} rejected the update to {}: {}",
                branch,
                commit_sha,
                body.trim()
            )));
        }
        Err(status_error("update ref", status, &body))
    }
}
