use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use trove_cache_sweeper::{CacheSweeper, Matcher};
use trove_git_source::SourceChange;
use trove_runtime_config::SiteConfig;

/// Purge a site's cached pages whenever its tracked folder changes.
pub async fn run_invalidation(
    mut changes: broadcast::Receiver<SourceChange>,
    sites: watch::Receiver<Arc<Vec<SiteConfig>>>,
    sweeper: CacheSweeper,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    invalidate(&change, &sites, &sweeper).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} source change(s); cache may be stale", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Returns the number of removed cache entries, or `None` when the site has
/// no hostname to purge.
pub async fn invalidate(
    change: &SourceChange,
    sites: &watch::Receiver<Arc<Vec<SiteConfig>>>,
    sweeper: &CacheSweeper,
) -> Option<usize> {
    let hostname = sites
        .borrow()
        .iter()
        .find(|s| s.id == change.site)
        .and_then(|s| s.hostname.clone());
    let Some(hostname) = hostname else {
        debug!(site = %change.site, "source changed; site has no hostname to purge");
        return None;
    };

    info!(site = %change.site, path = %change.path, versions = change.after.len(), "source changed");
    match sweeper.purge(&hostname, Matcher::Any).await {
        Ok(removed) => {
            info!(hostname = %hostname, removed = removed.len(), "purged proxy cache");
            Some(removed.len())
        }
        Err(e) => {
            warn!(hostname = %hostname, error = %e, "cache purge failed");
            Some(0)
        }
    }
}
