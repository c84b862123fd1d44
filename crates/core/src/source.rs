use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::hash::sha256_hex;

/// Identity of a tracked git repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoRef {
    /// Repository reachable through a hosted API (GitHub).
    Hosted { url: String },
    /// Working copy on the local filesystem.
    Local { path: PathBuf },
}

impl RepoRef {
    pub fn hosted(url: impl Into<String>) -> Self {
        Self::Hosted { url: url.into() }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Stable key; two `RepoRef`s with the same key share one watch.
    ///
    /// Hosted URLs that name an `owner/repo` key on host and name, so the
    /// https, `.git` and scp-style spellings of one repository collapse.
    pub fn key(&self) -> String {
        match self {
            Self::Hosted { url } => match (remote_host(url), normalize_repo_name(url)) {
                (Some(host), Some(name)) => format!("repo:{host}/{name}"),
                _ => format!("url:{}", url.trim().trim_end_matches('/')),
            },
            Self::Local { path } => format!("path:{}", path.display()),
        }
    }

    /// Short identifier used in webhook URLs (`/-/hook/<hook_id>`).
    pub fn hook_id(&self) -> String {
        sha256_hex(self.key().as_bytes())[..16].to_string()
    }

    /// `owner/repo` for hosted repositories.
    pub fn full_name(&self) -> Option<&str> {
        match self {
            Self::Hosted { url } => normalize_repo_name(url),
            Self::Local { .. } => None,
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hosted { url } => f.write_str(url),
            Self::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Lowercased host of a git remote URL, without user info or port.
fn remote_host(remote_url: &str) -> Option<String> {
    let s = remote_url.trim();
    let authority = match s.split_once("://") {
        Some((_, rest)) => rest.split('/').next()?,
        None => s.strip_prefix("git@")?.split(':').next()?,
    };
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Normalize a git remote URL to "owner/repo" form.
///
/// Handles:
///   - `https://github.com/foo/bar.git` → `foo/bar`
///   - `git@github.com:foo/bar.git` → `foo/bar`
///   - `ssh://git@github.com/foo/bar` → `foo/bar`
pub fn normalize_repo_name(remote_url: &str) -> Option<&str> {
    let s = remote_url.trim().trim_end_matches('/');

    if let Some(rest) = s.strip_prefix("git@") {
        let path = rest.split_once(':')?.1;
        let path = path.strip_suffix(".git").unwrap_or(path);
        return if path.contains('/') { Some(path) } else { None };
    }

    if s.starts_with("https://") || s.starts_with("http://") || s.starts_with("ssh://") {
        let without_scheme = s.split("://").nth(1)?;
        let path_start = without_scheme.find('/')? + 1;
        let path = &without_scheme[path_start..];
        let path = path.strip_suffix(".git").unwrap_or(path);
        return if path.split('/').count() == 2 && !path.starts_with('/') {
            Some(path)
        } else {
            None
        };
    }

    None
}
