//! Keeps the tracker's folder watches in line with the configured sites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use trove_core::{AggregateError, RepoRef};
use trove_runtime_config::{RetrySettings, SiteConfig};

use crate::error::GitSourceError;
use crate::tracker::{GitSourceTracker, WatchCallback, WatchId};
use crate::types::{RefMap, normalize_path};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// One folder that should be watched on behalf of a site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub site: String,
    pub repo: RepoRef,
    pub path: String,
}

impl WatchTarget {
    fn key(&self) -> String {
        format!("{}\n{}\n{}", self.site, self.repo.key(), self.path)
    }
}

/// Versions of a site's tracked folder moved.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChange {
    pub site: String,
    pub repo: RepoRef,
    pub path: String,
    pub before: RefMap,
    pub after: RefMap,
}

/// Exponential backoff for failed reconciliation passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Ceiling applied when upstream is rate limiting.
    pub rate_limited_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base: Duration::from_millis(settings.base_delay_ms),
            max: Duration::from_secs(settings.max_delay_secs),
            rate_limited_max: Duration::from_secs(settings.rate_limit_max_delay_secs),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max);
        if rate_limited {
            delay.min(self.rate_limited_max)
        } else {
            delay
        }
    }
}

/// Desired watch targets keyed by site, repository and folder.
pub fn desired_targets(sites: &[SiteConfig]) -> HashMap<String, WatchTarget> {
    let mut targets = HashMap::new();
    for site in sites {
        let Some(repo) = site.repo() else {
            debug!(site = %site.id, "site has no repository; nothing to watch");
            continue;
        };
        let target = WatchTarget {
            site: site.id.clone(),
            repo,
            path: normalize_path(&site.repo_folder),
        };
        targets.insert(target.key(), target);
    }
    targets
}

struct ActiveWatch {
    target: WatchTarget,
    /// `None` while the watch is still being installed.
    id: Option<WatchId>,
}

struct ReconcilerInner {
    tracker: Arc<GitSourceTracker>,
    policy: RetryPolicy,
    active: Mutex<HashMap<String, ActiveWatch>>,
    sites: Mutex<Arc<Vec<SiteConfig>>>,
    attempts: AtomicU32,
    pass: AtomicU64,
    pass_lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<SourceChange>,
    retry_tx: mpsc::UnboundedSender<u64>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

#[derive(Clone)]
pub struct WatchReconciler {
    inner: Arc<ReconcilerInner>,
}

impl WatchReconciler {
    pub fn new(tracker: Arc<GitSourceTracker>, policy: RetryPolicy) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ReconcilerInner {
                tracker,
                policy,
                active: Mutex::new(HashMap::new()),
                sites: Mutex::new(Arc::new(Vec::new())),
                attempts: AtomicU32::new(0),
                pass: AtomicU64::new(0),
                pass_lock: tokio::sync::Mutex::new(()),
                changes,
                retry_tx,
                retry_rx: Mutex::new(Some(retry_rx)),
            }),
        }
    }

    /// Version changes of every watched site folder.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceChange> {
        self.inner.changes.subscribe()
    }

    pub fn active_targets(&self) -> Vec<WatchTarget> {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        active.values().map(|a| a.target.clone()).collect()
    }

    /// Consecutive failed passes since the last success.
    pub fn failed_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Adopt `sites` as the desired state and converge towards it.
    pub async fn reconcile(
        &self,
        sites: Arc<Vec<SiteConfig>>,
    ) -> Result<(), AggregateError<GitSourceError>> {
        *self.inner.sites.lock().unwrap_or_else(|e| e.into_inner()) = sites;
        self.reconcile_current().await
    }

    async fn reconcile_current(&self) -> Result<(), AggregateError<GitSourceError>> {
        let _pass_guard = self.inner.pass_lock.lock().await;
        let pass = self.inner.pass.fetch_add(1, Ordering::SeqCst) + 1;
        let sites = self
            .inner
            .sites
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut desired = desired_targets(&sites);

        // Record the outcome up front; failures below roll their entry back.
        let (to_remove, to_add) = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<String> = active
                .keys()
                .filter(|key| !desired.contains_key(*key))
                .cloned()
                .collect();
            let to_remove: Vec<(String, ActiveWatch)> = stale
                .into_iter()
                .filter_map(|key| active.remove(&key).map(|watch| (key, watch)))
                .collect();

            desired.retain(|key, _| !active.contains_key(key));
            for (key, target) in &desired {
                active.insert(
                    key.clone(),
                    ActiveWatch {
                        target: target.clone(),
                        id: None,
                    },
                );
            }
            (to_remove, desired)
        };

        let tracker = &self.inner.tracker;
        let mut errors = Vec::new();

        for (key, watch) in to_remove {
            let target = &watch.target;
            let result = match watch.id {
                Some(id) => tracker.unwatch(&target.repo, id).await,
                None => tracker.unwatch_folder(&target.repo, &target.path).await,
            };
            match result {
                Ok(_) => info!(site = %target.site, repo = %target.repo, path = %target.path, "unwatched"),
                Err(e) => {
                    warn!(site = %target.site, repo = %target.repo, error = %e, "unwatch failed");
                    self.lock_active().insert(key, watch);
                    errors.push(e);
                }
            }
        }

        for (key, target) in to_add {
            let callback = self.callback_for(&target);
            match tracker.watch_folder(&target.repo, &target.path, callback).await {
                Ok(id) => {
                    info!(site = %target.site, repo = %target.repo, path = %target.path, "watching");
                    if let Some(watch) = self.lock_active().get_mut(&key) {
                        watch.id = Some(id);
                    }
                }
                Err(e) => {
                    warn!(site = %target.site, repo = %target.repo, error = %e, "watch failed");
                    self.lock_active().remove(&key);
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            self.inner.attempts.store(0, Ordering::SeqCst);
            return Ok(());
        }

        if !errors.iter().any(GitSourceError::is_retryable) {
            warn!("Reconciliation denied by upstream; not retrying until sites change");
        } else {
            let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst);
            let rate_limited = errors.iter().any(GitSourceError::is_rate_limited);
            let delay = self.inner.policy.delay(attempt, rate_limited);
            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconciliation retry"
            );
            self.schedule_retry(pass, delay);
        }
        Err(AggregateError::new(errors))
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveWatch>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule_retry(&self, pass: u64, delay: Duration) {
        let retry_tx = self.inner.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry_tx.send(pass);
        });
    }

    fn callback_for(&self, target: &WatchTarget) -> WatchCallback {
        let changes = self.inner.changes.clone();
        let target = target.clone();
        Arc::new(move |before: &RefMap, after: &RefMap| {
            let _ = changes.send(SourceChange {
                site: target.site.clone(),
                repo: target.repo.clone(),
                path: target.path.clone(),
                before: before.clone(),
                after: after.clone(),
            });
        })
    }

    /// Reconcile on every site update and on scheduled retries until
    /// shutdown.
    pub async fn run(
        &self,
        mut sites: watch::Receiver<Arc<Vec<SiteConfig>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let taken = {
            let mut guard = self.inner.retry_rx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(mut retries) = taken else {
            warn!("Reconciler already running");
            return;
        };

        let initial = sites.borrow_and_update().clone();
        log_outcome(self.reconcile(initial).await);

        // Once the config publisher is gone the last site list stays the
        // desired state; retries keep running until shutdown.
        let mut sites_open = true;
        loop {
            tokio::select! {
                changed = sites.changed(), if sites_open => {
                    if changed.is_err() {
                        debug!("Site configuration channel closed");
                        sites_open = false;
                        continue;
                    }
                    let current = sites.borrow_and_update().clone();
                    log_outcome(self.reconcile(current).await);
                }
                Some(pass) = retries.recv() => {
                    if pass == self.inner.pass.load(Ordering::SeqCst) {
                        log_outcome(self.reconcile_current().await);
                    } else {
                        debug!(pass, "skipping superseded retry");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    }
}

fn log_outcome(outcome: Result<(), AggregateError<GitSourceError>>) {
    if let Err(aggregate) = outcome {
        for e in &aggregate.errors {
            warn!("Reconciliation error: {}", e);
        }
    }
}
