//! HTTP clients for the shared remote caches.
//!
//! A remote repo cache answers ref resolutions, file reads and tree
//! listings so sources can be resolved without mirroring every
//! repository first. A remote artifact cache serves already-built
//! artifacts. Both are read-only; a 404 means "not there", any other
//! failure is surfaced so the caller can degrade gracefully.

use morph_core::RepoAliasResolver;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote cache request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote cache returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("failed to resolve ref {ref_} for repo {repo}")]
    ResolveRef { repo: String, ref_: String },
    #[error("failed to cat file {filename} in ref {ref_} of repo {repo}")]
    CatFile {
        repo: String,
        ref_: String,
        filename: String,
    },
    #[error("failed to list tree in ref {ref_} of repo {repo}")]
    LsTree { repo: String, ref_: String },
}

pub type Result<T> = std::result::Result<T, RemoteError>;

fn join(server_url: &str, path_and_query: &str) -> String {
    let base = server_url.trim_end_matches('/');
    format!("{base}/1.0/{path_and_query}")
}

#[derive(Debug, Deserialize)]
struct Sha1Response {
    sha1: String,
    tree: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: BTreeMap<String, serde_json::Value>,
}

/// Read-through client for a repository-side cache service.
#[derive(Debug)]
pub struct RemoteRepoCache {
    server_url: String,
    resolver: RepoAliasResolver,
    client: reqwest::Client,
}

impl RemoteRepoCache {
    pub fn new(server_url: impl Into<String>, resolver: RepoAliasResolver) -> Self {
        Self {
            server_url: server_url.into(),
            resolver,
            client: reqwest::Client::new(),
        }
    }

    fn sha1s_url(&self, repo_url: &str, ref_: &str) -> String {
        join(
            &self.server_url,
            &format!(
                "sha1s?repo={}&ref={}",
                urlencoding::encode(repo_url),
                urlencoding::encode(ref_)
            ),
        )
    }

    fn files_url(&self, repo_url: &str, ref_: &str, filename: &str) -> String {
        join(
            &self.server_url,
            &format!(
                "files?repo={}&ref={}&filename={}",
                urlencoding::encode(repo_url),
                urlencoding::encode(ref_),
                urlencoding::encode(filename)
            ),
        )
    }

    fn trees_url(&self, repo_url: &str, ref_: &str) -> String {
        join(
            &self.server_url,
            &format!(
                "trees?repo={}&ref={}",
                urlencoding::encode(repo_url),
                urlencoding::encode(ref_)
            ),
        )
    }

    pub async fn resolve_ref(&self, repo: &str, ref_: &str) -> Result<(String, String)> {
        let url = self.sha1s_url(&self.resolver.pull_url(repo), ref_);
        debug!(%url, "resolving ref via remote repo cache");
        let response = self.fetch(&url).await.map_err(|_| RemoteError::ResolveRef {
            repo: repo.to_string(),
            ref_: ref_.to_string(),
        })?;
        let parsed: Sha1Response =
            response.json().await.map_err(|_| RemoteError::ResolveRef {
                repo: repo.to_string(),
                ref_: ref_.to_string(),
            })?;
        Ok((parsed.sha1, parsed.tree))
    }

    pub async fn cat_file(&self, repo: &str, ref_: &str, filename: &str) -> Result<Vec<u8>> {
        let url = self.files_url(&self.resolver.pull_url(repo), ref_, filename);
        let response = self.fetch(&url).await.map_err(|_| RemoteError::CatFile {
            repo: repo.to_string(),
            ref_: ref_.to_string(),
            filename: filename.to_string(),
        })?;
        Ok(response
            .bytes()
            .await
            .map_err(|_| RemoteError::CatFile {
                repo: repo.to_string(),
                ref_: ref_.to_string(),
                filename: filename.to_string(),
            })?
            .to_vec())
    }

    pub async fn ls_tree(&self, repo: &str, ref_: &str) -> Result<Vec<String>> {
        let url = self.trees_url(&self.resolver.pull_url(repo), ref_);
        let response = self.fetch(&url).await.map_err(|_| RemoteError::LsTree {
            repo: repo.to_string(),
            ref_: ref_.to_string(),
        })?;
        let parsed: TreeResponse = response.json().await.map_err(|_| RemoteError::LsTree {
            repo: repo.to_string(),
            ref_: ref_.to_string(),
        })?;
        Ok(parsed.tree.into_keys().collect())
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

/// Read-only client for a shared artifact store.
#[derive(Debug)]
pub struct RemoteArtifactCache {
    server_url: String,
    client: reqwest::Client,
}

impl RemoteArtifactCache {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn artifact_url(&self, filename: &str) -> String {
        join(
            &self.server_url,
            &format!("artifacts?filename={}", urlencoding::encode(filename)),
        )
    }

    /// Fetch an artifact blob (or metadata file) by its exact cache
    /// filename. `Ok(None)` means the remote does not have it.
    pub async fn get(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        let url = self.artifact_url(filename);
        debug!(%url, "fetching from remote artifact cache");
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }
}
