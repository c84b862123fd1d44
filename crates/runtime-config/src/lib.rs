//! Shared trove configuration types.
//!
//! The daemon reads `trove.toml` into [`TroveConfig`]. Loading from disk and
//! reacting to edits lives in the daemon crate; these types only describe the
//! shape and the defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use trove_core::RepoRef;

/// Canonical config file name.
pub const CONFIG_FILE_NAME: &str = "trove.toml";

/// Top-level configuration (persisted as `trove.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TroveConfig {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub github: GitHubSettings,
    #[serde(default)]
    pub sweeper: SweeperSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

impl TroveConfig {
    /// Parse the contents of a `trove.toml`.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    /// Public base URL; push webhooks are pointed at `<public_url>/-/hook/<id>`.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Empty means "derive from the host's network interfaces".
    #[serde(default)]
    pub hook_secret: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            hook_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitHubSettings {
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: String,
    /// Upper bound on pages fetched per paginated listing.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            token: String::new(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweeperSettings {
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Ceiling applied when upstream answers `429 Too Many Requests`.
    #[serde(default = "default_rate_limit_max_delay_secs")]
    pub rate_limit_max_delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            rate_limit_max_delay_secs: default_rate_limit_max_delay_secs(),
        }
    }
}

/// One served site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SiteConfig {
    pub id: String,
    /// Hostname the reverse proxy caches this site under.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Content folder (relative to the storage root) holding derived artifacts.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    /// Path inside the repository to track; empty tracks the whole tree.
    #[serde(default)]
    pub repo_folder: String,
}

impl SiteConfig {
    /// Repository backing this site. A URL wins over a local path.
    pub fn repo(&self) -> Option<RepoRef> {
        if let Some(url) = self.repo_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(RepoRef::hosted(url.trim()));
        }
        self.repo_path.clone().map(RepoRef::local)
    }

    /// Content folder, defaulting to the site id.
    pub fn content_folder(&self) -> &str {
        self.folder.as_deref().unwrap_or(&self.id)
    }
}

// ── Serde default functions ─────────────────────────────────────────────

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/trove/content")
}
fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_max_pages() -> u32 {
    5
}
fn default_cache_root() -> PathBuf {
    PathBuf::from("/var/cache/nginx")
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_secs() -> u64 {
    3600
}
fn default_rate_limit_max_delay_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = TroveConfig::default();
        assert_eq!(cfg.github.api_url, "https://api.github.com");
        assert_eq!(cfg.github.max_pages, 5);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.retry.max_delay_secs, 3600);
        assert_eq!(cfg.retry.rate_limit_max_delay_secs, 300);
        assert!(cfg.sites.is_empty());
    }

    #[test]
    fn sites_deserialize_from_toml() {
        let cfg = TroveConfig::from_toml(
            r#"
[storage]
root = "/data/content"

[[sites]]
id = "docs"
hostname = "docs.example"
repo_url = "https://github.com/acme/docs"
repo_folder = "sheets"

[[sites]]
id = "local"
folder = "local-content"
repo_path = "/srv/git/local"
"#,
        )
        .expect("parse sites");

        assert_eq!(cfg.storage.root, PathBuf::from("/data/content"));
        assert_eq!(cfg.sites.len(), 2);
        assert_eq!(
            cfg.sites[0].repo(),
            Some(RepoRef::hosted("https://github.com/acme/docs"))
        );
        assert_eq!(cfg.sites[0].content_folder(), "docs");
        assert_eq!(cfg.sites[1].repo(), Some(RepoRef::local("/srv/git/local")));
        assert_eq!(cfg.sites[1].content_folder(), "local-content");
        assert_eq!(cfg.sites[1].repo_folder, "");
    }

    #[test]
    fn blank_url_falls_back_to_path() {
        let site = SiteConfig {
            id: "x".into(),
            repo_url: Some("  ".into()),
            repo_path: Some(PathBuf::from("/srv/x")),
            ..Default::default()
        };
        assert_eq!(site.repo(), Some(RepoRef::local("/srv/x")));

        let bare = SiteConfig {
            id: "y".into(),
            ..Default::default()
        };
        assert_eq!(bare.repo(), None);
    }

    #[test]
    fn config_roundtrip() {
        let mut cfg = TroveConfig::default();
        cfg.sites.push(SiteConfig {
            id: "docs".into(),
            hostname: Some("docs.example".into()),
            ..Default::default()
        });
        let encoded = toml::to_string_pretty(&cfg).expect("serialize config");
        let parsed: TroveConfig = toml::from_str(&encoded).expect("parse config");
        assert_eq!(parsed, cfg);
    }
}
