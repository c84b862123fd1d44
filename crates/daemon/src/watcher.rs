use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use trove_runtime_config::SiteConfig;

use crate::config;

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Keeps the config watch alive; dropping it stops reloads.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    reload: JoinHandle<()>,
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.reload.abort();
    }
}

/// Watch the config file and publish its site list whenever it changes.
pub fn start_config_watcher(
    path: &Path,
    sites: watch::Sender<Arc<Vec<SiteConfig>>>,
) -> Result<ConfigWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path.file_name().map(|n| n.to_os_string());

    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                let touches_config = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if touches_config && !matches!(event.kind, notify::EventKind::Access(_)) {
                    let _ = tx.send(());
                }
            }
            Err(e) => {
                error!("Config watcher error: {}", e);
            }
        }
    })
    .context("Failed to create config watcher")?;

    // Watch the directory: editors replace the file rather than write in place.
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    info!("Watching config: {}", path.display());

    let reload = tokio::spawn(reload_loop(path.to_path_buf(), rx, sites));
    Ok(ConfigWatcher {
        _watcher: watcher,
        reload,
    })
}

async fn reload_loop(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<()>,
    sites: watch::Sender<Arc<Vec<SiteConfig>>>,
) {
    while rx.recv().await.is_some() {
        // Coalesce the burst of events a single save produces.
        while let Ok(Some(())) = tokio::time::timeout(RELOAD_DEBOUNCE, rx.recv()).await {}
        publish_sites(&path, &sites);
    }
}

/// Re-read `path` and publish its sites if they differ. Returns whether
/// anything was published.
pub fn publish_sites(path: &Path, sites: &watch::Sender<Arc<Vec<SiteConfig>>>) -> bool {
    let loaded = match config::load_config(path) {
        Ok(cfg) => cfg.sites,
        Err(e) => {
            warn!("Keeping previous sites; config reload failed: {:#}", e);
            return false;
        }
    };
    let changed = sites.send_if_modified(|current| {
        if **current == loaded {
            return false;
        }
        *current = Arc::new(loaded);
        true
    });
    if changed {
        info!("Config reloaded: {} site(s)", sites.borrow().len());
    } else {
        debug!("Config touched without site changes");
    }
    changed
}
