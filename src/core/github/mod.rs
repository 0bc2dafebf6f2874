//! GitHub deployment: create a repository and push the sandbox as one commit.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::backend::{BackendError, ExecutionBackend};
use crate::core::kv::{GITHUB_TOKEN_KEY, KvError, KvStore};

/// Default API root.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Default commit message for pushes.
pub const DEFAULT_COMMIT_MESSAGE: &str = "Update files via OnyxGPT";

/// Directories never pushed.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist"];

/// GitHub errors.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub token not found, run `onyx github login`")]
    MissingToken,

    /// Non-2xx response.
    #[error("GitHub API error ({status}) during {context}: {message}")]
    Api {
        status: u16,
        context: String,
        message: String,
    },

    #[error("branch {branch} not found after {attempts} attempts, ensure the repository is initialized")]
    BranchNotReady { branch: String, attempts: u32 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token storage failed: {0}")]
    Kv(#[from] KvError),

    #[error("reading sandbox files failed: {0}")]
    Backend(#[from] BackendError),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

pub type Result<T> = std::result::Result<T, GitHubError>;

/// Store the token under [`GITHUB_TOKEN_KEY`].
pub async fn save_token(kv: &dyn KvStore, token: &str) -> Result<()> {
    kv.set(GITHUB_TOKEN_KEY, token.trim()).await?;
    Ok(())
}

pub async fn load_token(kv: &dyn KvStore) -> Result<Option<String>> {
    Ok(kv.get(GITHUB_TOKEN_KEY).await?.filter(|t| !t.is_empty()))
}

pub async fn delete_token(kv: &dyn KvStore) -> Result<()> {
    kv.del(GITHUB_TOKEN_KEY).await?;
    Ok(())
}

/// How long to wait for a new repository's branch to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total lookups, including the first.
    pub attempts: u32,
    /// Pause between lookups.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_millis(1000),
        }
    }
}

/// Authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct GitHubUser {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RepositoryOwner {
    pub login: String,
}

/// A repository as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: RepositoryOwner,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub private: bool,
}

/// A file to push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct PushResult {
    pub branch: String,
    pub commit_sha: String,
    pub files: usize,
}

#[derive(Deserialize)]
struct Sha {
    sha: String,
}

#[derive(Deserialize)]
struct BranchCommitDetail {
    tree: Sha,
}

#[derive(Deserialize)]
struct BranchCommit {
    sha: String,
    commit: BranchCommitDetail,
}

#[derive(Deserialize)]
struct Branch {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Serialize)]
struct TreeItem<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: String,
}

/// GitHub REST client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    retry: RetryPolicy,
    commit_message: String,
}

impl GitHubClient {
    /// Client authenticated with `token`.
    ///
    /// # Errors
    ///
    /// Returns error if the token cannot be used as a header value.
    pub fn new(token: &str, api_base: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("token {}", token.trim()))
                .map_err(|e| GitHubError::InvalidToken(e.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github.v3+json"));
        if let Ok(agent) = HeaderValue::from_str(&crate::build_info::user_agent()) {
            headers.insert(USER_AGENT, agent);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
        })
    }

    /// Client using the token stored in `kv`.
    ///
    /// # Errors
    ///
    /// Returns [`GitHubError::MissingToken`] when no token is stored.
    pub async fn from_kv(kv: &dyn KvStore, api_base: impl Into<String>) -> Result<Self> {
        let token = load_token(kv).await?.ok_or(GitHubError::MissingToken)?;
        Self::new(&token, api_base)
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiMessage>(&body)
                .map(|m| m.message)
                .unwrap_or(body);
            return Err(GitHubError::Api {
                status: status.as_u16(),
                context: context.to_string(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// The token's user.
    pub async fn user(&self) -> Result<GitHubUser> {
        self.send(self.http.get(self.url("/user")), "fetch user").await
    }

    /// Create a repository with an initial commit so its default branch exists.
    pub async fn create_repository(
        &self,
        name: &str,
        description: &str,
        private: bool,
    ) -> Result<Repository> {
        let body = serde_json::json!({
            "name": name,
            "description": description,
            "private": private,
            "auto_init": true,
        });
        let repo: Repository = self
            .send(self.http.post(self.url("/user/repos")).json(&body), "create repository")
            .await?;
        tracing::info!(repo = %repo.full_name, "repository created");
        Ok(repo)
    }

    async fn branch(&self, owner: &str, repo: &str, branch: &str) -> Result<Branch> {
        let url = self.url(&format!("/repos/{owner}/{repo}/branches/{branch}"));
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.send::<Branch>(self.http.get(&url), "fetch branch").await {
                Ok(found) => return Ok(found),
                // A fresh repository answers 404 until its initial commit lands.
                Err(GitHubError::Api { status: 404, .. }) => {
                    tracing::debug!(attempt, branch = %branch, "branch not ready");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.interval).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(GitHubError::BranchNotReady {
            branch: branch.to_string(),
            attempts,
        })
    }

    /// Push `files` to `branch` as a single commit on top of its current head.
    ///
    /// Nothing changes on the remote branch unless every step succeeds; blobs and
    /// trees created before a failure are left unreferenced.
    pub async fn push_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        files: &[FileEntry],
    ) -> Result<PushResult> {
        let head = self.branch(owner, repo, branch).await?;
        let base_tree = head.commit.commit.tree.sha;
        let parent = head.commit.sha;

        let mut tree = Vec::with_capacity(files.len());
        for file in files {
            let blob: Sha = self
                .send(
                    self.http
                        .post(self.url(&format!("/repos/{owner}/{repo}/git/blobs")))
                        .json(&serde_json::json!({ "content": file.content, "encoding": "utf-8" })),
                    &format!("create blob for {}", file.path),
                )
                .await?;
            tree.push(TreeItem {
                path: &file.path,
                mode: "100644",
                kind: "blob",
                sha: blob.sha,
            });
        }

        let new_tree: Sha = self
            .send(
                self.http
                    .post(self.url(&format!("/repos/{owner}/{repo}/git/trees")))
                    .json(&serde_json::json!({ "base_tree": base_tree, "tree": tree })),
                "create tree",
            )
            .await?;

        let commit: Sha = self
            .send(
                self.http
                    .post(self.url(&format!("/repos/{owner}/{repo}/git/commits")))
                    .json(&serde_json::json!({
                        "message": self.commit_message,
                        "tree": new_tree.sha,
                        "parents": [parent],
                    })),
                "create commit",
            )
            .await?;

        let _: serde_json::Value = self
            .send(
                self.http
                    .patch(self.url(&format!("/repos/{owner}/{repo}/git/refs/heads/{branch}")))
                    .json(&serde_json::json!({ "sha": commit.sha })),
                "update branch reference",
            )
            .await?;

        tracing::info!(repo = %format!("{owner}/{repo}"), branch = %branch, files = files.len(), "pushed");
        Ok(PushResult {
            branch: branch.to_string(),
            commit_sha: commit.sha,
            files: files.len(),
        })
    }
}

/// Every file in the sandbox except build output and dependencies.
pub async fn collect_backend_files(backend: &dyn ExecutionBackend) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    let mut pending = vec![String::new()];

    while let Some(dir) = pending.pop() {
        let listing = if dir.is_empty() { "." } else { dir.as_str() };
        for entry in backend.list_directory(listing).await? {
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{dir}/{}", entry.name)
            };
            if entry.is_dir {
                if !SKIPPED_DIRS.contains(&entry.name.as_str()) {
                    pending.push(path);
                }
            } else {
                let content = backend.read_file(&path).await?;
                files.push(FileEntry { path, content });
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::{BackendConnector, LocalConnector};
    use crate::core::kv::MemoryKv;

    #[tokio::test]
    async fn token_roundtrip() {
        let kv = MemoryKv::new();
        assert!(load_token(&kv).await.unwrap().is_none());
        save_token(&kv, " ghp_abc \n").await.unwrap();
        assert_eq!(load_token(&kv).await.unwrap().as_deref(), Some("ghp_abc"));
        delete_token(&kv).await.unwrap();
        assert!(load_token(&kv).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn from_kv_requires_token() {
        let kv = MemoryKv::new();
        assert!(matches!(
            GitHubClient::from_kv(&kv, DEFAULT_API_BASE).await,
            Err(GitHubError::MissingToken)
        ));
    }

    #[test]
    fn default_retry_matches_branch_initialization() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn collects_files_skipping_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalConnector::new(dir.path().to_path_buf(), false)
            .connect("demo")
            .await
            .unwrap();
        backend.write_file("package.json", "{}").await.unwrap();
        backend.write_file("src/App.jsx", "app").await.unwrap();
        backend.write_file("node_modules/react/index.js", "x").await.unwrap();
        backend.write_file("dist/index.html", "x").await.unwrap();

        let files = collect_backend_files(backend.as_ref()).await.unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["package.json", "src/App.jsx"]);
    }
}
