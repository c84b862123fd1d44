//! GitHub REST backend.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

use trove_core::RepoRef;
use trove_runtime_config::{GitHubSettings, ServerSettings};

use crate::adapter::{ChangeSender, SourceAdapter, WatchHandle};
use crate::error::{GitSourceError, Result};
use crate::types::{CommitNode, RefHead, normalize_path};

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: usize = 100;
const MAX_TAG_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token: String,
    /// Base URL GitHub delivers push events to.
    pub public_url: String,
    pub hook_secret: String,
    pub max_pages: u32,
}

impl GitHubConfig {
    pub fn from_settings(github: &GitHubSettings, server: &ServerSettings, hook_secret: &str) -> Self {
        Self {
            api_url: github.api_url.trim_end_matches('/').to_string(),
            token: github.token.clone(),
            public_url: server.public_url.trim_end_matches('/').to_string(),
            hook_secret: hook_secret.to_string(),
            max_pages: github.max_pages,
        }
    }

    pub fn hook_url(&self, repo: &RepoRef) -> String {
        format!(
            "{}/-/hook/{}",
            self.public_url.trim_end_matches('/'),
            repo.hook_id()
        )
    }
}

pub struct GitHubAdapter {
    config: GitHubConfig,
    client: reqwest::Client,
}

impl GitHubAdapter {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("trove/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    fn full_name<'a>(&self, repo: &'a RepoRef) -> Result<&'a str> {
        repo.full_name()
            .ok_or_else(|| GitSourceError::Unsupported(repo.to_string()))
    }

    fn repo_url(&self, repo: &RepoRef, suffix: &str) -> Result<String> {
        Ok(format!(
            "{}/repos/{}{}",
            self.config.api_url,
            self.full_name(repo)?,
            suffix
        ))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, url)
            .header("Accept", ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if self.config.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.config.token)
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message: String = body.chars().take(512).collect();
        Err(GitSourceError::Upstream {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.send(self.request(Method::GET, url)).await?;
        Ok(resp.json().await?)
    }

    async fn get_paged<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for page in 1..=self.config.max_pages.max(1) {
            let page = page.to_string();
            let per_page = PER_PAGE.to_string();
            let req = self
                .request(Method::GET, url)
                .query(&[("per_page", per_page.as_str()), ("page", page.as_str())])
                .query(query);
            let items: Vec<T> = self.send(req).await?.json().await?;
            let count = items.len();
            out.extend(items);
            if count < PER_PAGE {
                break;
            }
        }
        Ok(out)
    }

    /// Resolve a branch, tag or sha to a commit sha.
    async fn resolve_commit(&self, repo: &RepoRef, reference: &str) -> Result<String> {
        let reference = reference.strip_prefix("refs/").unwrap_or(reference);
        if is_full_sha(reference) {
            return Ok(reference.to_string());
        }

        let candidates = if reference.starts_with("heads/") || reference.starts_with("tags/") {
            vec![reference.to_string()]
        } else {
            vec![format!("heads/{reference}"), format!("tags/{reference}")]
        };

        let mut last_err = GitSourceError::NotFound(format!("{repo}@{reference}"));
        for candidate in candidates {
            let url = self.repo_url(repo, &format!("/git/ref/{}", encode_ref_path(&candidate)))?;
            match self.get_json::<GitRef>(&url).await {
                Ok(found) => return self.peel(repo, found.object).await,
                Err(e) if e.status() == Some(404) => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn peel(&self, repo: &RepoRef, mut object: GitObject) -> Result<String> {
        for _ in 0..MAX_TAG_DEPTH {
            if object.kind != "tag" {
                return Ok(object.sha);
            }
            let url = self.repo_url(repo, &format!("/git/tags/{}", object.sha))?;
            object = self.get_json::<GitTag>(&url).await?.object;
        }
        Err(GitSourceError::NotFound(format!(
            "{repo}: tag chain deeper than {MAX_TAG_DEPTH}"
        )))
    }
}

#[async_trait]
impl SourceAdapter for GitHubAdapter {
    fn name(&self) -> &'static str {
        "github"
    }

    fn can_handle(&self, repo: &RepoRef) -> bool {
        matches!(repo, RepoRef::Hosted { .. }) && repo.full_name().is_some()
    }

    async fn retrieve_file(
        &self,
        repo: &RepoRef,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Vec<u8>> {
        let reference = match reference {
            Some(r) => r.to_string(),
            None => self.get_default_branch(repo).await?,
        };
        let commit_sha = self.resolve_commit(repo, &reference).await?;

        let commit: GitCommit = self
            .get_json(&self.repo_url(repo, &format!("/git/commits/{commit_sha}"))?)
            .await?;
        let tree: Tree = self
            .get_json(&format!("{}?recursive=1", commit.tree.url))
            .await?;

        let wanted = normalize_path(path);
        let entry = tree
            .tree
            .iter()
            .find(|e| e.kind == "blob" && e.path == wanted)
            .ok_or_else(|| {
                let hint = if tree.truncated { " (tree listing truncated)" } else { "" };
                GitSourceError::NotFound(format!("{repo}:{wanted}@{reference}{hint}"))
            })?;

        let blob: Blob = self.get_json(&entry.url).await?;
        decode_blob(&blob)
    }

    async fn get_default_branch(&self, repo: &RepoRef) -> Result<String> {
        let info: RepoInfo = self.get_json(&self.repo_url(repo, "")?).await?;
        Ok(info.default_branch)
    }

    async fn list_heads(&self, repo: &RepoRef) -> Result<Vec<RefHead>> {
        let branches: Vec<NamedCommit> = self
            .get_paged(&self.repo_url(repo, "/branches")?, &[])
            .await?;
        let tags: Vec<NamedCommit> = self.get_paged(&self.repo_url(repo, "/tags")?, &[]).await?;

        let mut heads: Vec<RefHead> = branches
            .into_iter()
            .map(|b| RefHead::branch(&b.name, b.commit.sha))
            .collect();
        heads.extend(tags.into_iter().map(|t| RefHead::tag(&t.name, t.commit.sha)));
        Ok(heads)
    }

    async fn list_commits(&self, repo: &RepoRef, path: Option<&str>) -> Result<Vec<CommitNode>> {
        let path = path.map(normalize_path).filter(|p| !p.is_empty());
        let query: Vec<(&str, &str)> = match &path {
            Some(p) => vec![("path", p.as_str())],
            None => Vec::new(),
        };
        let commits: Vec<ApiCommit> = self
            .get_paged(&self.repo_url(repo, "/commits")?, &query)
            .await?;
        debug!(repo = %repo, path = ?path, count = commits.len(), "listed commits");
        Ok(commits.into_iter().map(CommitNode::from).collect())
    }

    async fn install_watch(&self, repo: &RepoRef, _signal: ChangeSender) -> Result<WatchHandle> {
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["push"],
            "config": {
                "url": self.config.hook_url(repo),
                "content_type": "json",
                "secret": self.config.hook_secret,
                "insecure_ssl": "0",
            },
        });
        let req = self
            .request(Method::POST, &self.repo_url(repo, "/hooks")?)
            .json(&body);
        let hook: Hook = self.send(req).await?.json().await?;
        info!(repo = %repo, hook = hook.id, "installed push webhook");
        Ok(WatchHandle::Webhook { id: hook.id })
    }

    async fn remove_watch(&self, repo: &RepoRef, handle: &WatchHandle) -> Result<()> {
        let WatchHandle::Webhook { id } = handle else {
            return Ok(());
        };
        let req = self.request(Method::DELETE, &self.repo_url(repo, &format!("/hooks/{id}"))?);
        match self.send(req).await {
            Ok(_) => {
                info!(repo = %repo, hook = id, "removed push webhook");
                Ok(())
            }
            Err(e) if e.status() == Some(404) => {
                debug!(repo = %repo, hook = id, "webhook already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_full_sha(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn encode_ref_path(reference: &str) -> String {
    reference
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_blob(blob: &Blob) -> Result<Vec<u8>> {
    match blob.encoding.as_str() {
        "base64" => {
            let cleaned: String = blob.content.split_whitespace().collect();
            base64::engine::general_purpose::STANDARD
                .decode(cleaned)
                .map_err(|e| GitSourceError::Upstream {
                    status: 200,
                    message: format!("invalid base64 blob: {e}"),
                })
        }
        "utf-8" | "utf8" => Ok(blob.content.clone().into_bytes()),
        other => Err(GitSourceError::Upstream {
            status: 200,
            message: format!("unsupported blob encoding {other}"),
        }),
    }
}

// ── API shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct NamedCommit {
    name: String,
    commit: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
    #[serde(default)]
    parents: Vec<ShaOnly>,
    commit: ApiCommitDetail,
}

#[derive(Debug, Deserialize)]
struct ApiCommitDetail {
    #[serde(default)]
    author: Option<ApiSignature>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiSignature {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

impl From<ApiCommit> for CommitNode {
    fn from(c: ApiCommit) -> Self {
        let (author, email, date) = match c.commit.author {
            Some(sig) => (sig.name, sig.email, sig.date),
            None => (String::new(), String::new(), None),
        };
        Self {
            sha: c.sha,
            parents: c.parents.into_iter().map(|p| p.sha).collect(),
            author,
            email,
            date,
            message: c.commit.message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitTag {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitCommit {
    tree: Linked,
}

#[derive(Debug, Deserialize)]
struct Linked {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Tree {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct Blob {
    content: String,
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: u64,
}
