use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use trove_git_source::derive_hook_secret;
use trove_local_store::ExpiryTarget;
use trove_runtime_config::{CONFIG_FILE_NAME, SiteConfig, TroveConfig};

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .context("Could not determine home directory")?;
    Ok(PathBuf::from(home).join(".config").join("trove"))
}

/// Get the default config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load config from disk; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<TroveConfig> {
    if !path.exists() {
        return Ok(TroveConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    let config = TroveConfig::from_toml(&content)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Configured webhook secret, or one derived from this host.
pub fn hook_secret(config: &TroveConfig) -> String {
    let configured = config.server.hook_secret.trim();
    if configured.is_empty() {
        derive_hook_secret()
    } else {
        configured.to_string()
    }
}

/// Content folders whose sidecars are scanned for pending expirations.
pub fn expiry_targets(sites: &[SiteConfig]) -> Vec<ExpiryTarget> {
    sites
        .iter()
        .map(|site| ExpiryTarget {
            scope: site.id.clone(),
            folder: site.content_folder().to_string(),
        })
        .collect()
}
