//! Per-repository watch table and change fan-out.
//!
//! Several folders of one repository share a single adapter watch. When an
//! adapter signals that refs moved (or a push webhook arrives), the tracker
//! recomputes the version refs of the affected folders and calls back with
//! `(before, after)` for every folder whose map changed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use trove_core::{AggregateError, RepoRef};

use crate::adapter::{ChangeSender, SourceAdapter, WatchHandle};
use crate::error::{GitSourceError, Result};
use crate::types::{CommitVersion, RefMap, normalize_path};
use crate::webhook::{PushPayload, verify_signature};

/// Called with the previous and the new version refs of a watched folder.
pub type WatchCallback = Arc<dyn Fn(&RefMap, &RefMap) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct WatchEntry {
    id: WatchId,
    path: String,
    versions: RefMap,
    callback: WatchCallback,
}

struct RepoWatch {
    repo: RepoRef,
    adapter: Arc<dyn SourceAdapter>,
    handle: WatchHandle,
    entries: Vec<WatchEntry>,
}

pub struct GitSourceTracker {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    hook_secret: String,
    watches: Mutex<HashMap<String, RepoWatch>>,
    signal_tx: ChangeSender,
    signal_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    next_id: AtomicU64,
}

impl GitSourceTracker {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>, hook_secret: impl Into<String>) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            adapters,
            hook_secret: hook_secret.into(),
            watches: Mutex::new(HashMap::new()),
            signal_tx,
            signal_rx: std::sync::Mutex::new(Some(signal_rx)),
            next_id: AtomicU64::new(1),
        }
    }

    /// First registered adapter that accepts `repo`.
    pub fn adapter_for(&self, repo: &RepoRef) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.can_handle(repo))
            .cloned()
            .ok_or_else(|| GitSourceError::Unsupported(repo.to_string()))
    }

    pub async fn retrieve_file(
        &self,
        repo: &RepoRef,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Vec<u8>> {
        self.adapter_for(repo)?
            .retrieve_file(repo, path, reference)
            .await
    }

    pub async fn retrieve_versions(&self, repo: &RepoRef, path: &str) -> Result<Vec<CommitVersion>> {
        self.adapter_for(repo)?
            .retrieve_versions(repo, &normalize_path(path))
            .await
    }

    pub async fn retrieve_version_refs(&self, repo: &RepoRef, path: &str) -> Result<RefMap> {
        self.adapter_for(repo)?
            .retrieve_version_refs(repo, &normalize_path(path))
            .await
    }

    pub async fn get_default_branch(&self, repo: &RepoRef) -> Result<String> {
        self.adapter_for(repo)?.get_default_branch(repo).await
    }

    /// Start tracking `path` in `repo`. The first folder of a repository
    /// installs the adapter watch.
    pub async fn watch_folder(
        &self,
        repo: &RepoRef,
        path: &str,
        callback: WatchCallback,
    ) -> Result<WatchId> {
        let adapter = self.adapter_for(repo)?;
        let path = normalize_path(path);
        let versions = adapter.retrieve_version_refs(repo, &path).await?;
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = WatchEntry {
            id,
            path: path.clone(),
            versions,
            callback,
        };

        let key = repo.key();
        let mut watches = self.watches.lock().await;
        if let Some(existing) = watches.get_mut(&key) {
            existing.entries.push(entry);
            debug!(repo = %repo, path = %path, "added folder to existing watch");
            return Ok(id);
        }

        let handle = adapter.install_watch(repo, self.signal_tx.clone()).await?;
        info!(repo = %repo, path = %path, adapter = adapter.name(), "watching repository");
        watches.insert(
            key,
            RepoWatch {
                repo: repo.clone(),
                adapter,
                handle,
                entries: vec![entry],
            },
        );
        Ok(id)
    }

    /// Stop one watch registration. Returns whether it existed.
    pub async fn unwatch(&self, repo: &RepoRef, id: WatchId) -> Result<bool> {
        self.remove_entry(repo, |e| e.id == id).await
    }

    /// Stop the first registration of `path` in `repo`.
    pub async fn unwatch_folder(&self, repo: &RepoRef, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        self.remove_entry(repo, |e| e.path == path).await
    }

    async fn remove_entry(
        &self,
        repo: &RepoRef,
        matches: impl Fn(&WatchEntry) -> bool + Send,
    ) -> Result<bool> {
        let key = repo.key();
        let mut watches = self.watches.lock().await;
        let Some(watch) = watches.get_mut(&key) else {
            return Ok(false);
        };

        let removed = match watch.entries.iter().position(matches) {
            Some(pos) => {
                watch.entries.remove(pos);
                true
            }
            None => false,
        };
        if !watch.entries.is_empty() {
            return Ok(removed);
        }

        // Last folder gone. On failure the empty watch stays so a later
        // unwatch can retry the teardown.
        watch.adapter.remove_watch(&watch.repo, &watch.handle).await?;
        watches.remove(&key);
        info!(repo = %repo, "stopped watching repository");
        Ok(removed)
    }

    pub async fn watched_paths(&self, repo: &RepoRef) -> Vec<String> {
        let watches = self.watches.lock().await;
        watches
            .get(&repo.key())
            .map(|w| w.entries.iter().map(|e| e.path.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn is_watching(&self, repo: &RepoRef) -> bool {
        self.watches.lock().await.contains_key(&repo.key())
    }

    /// Recompute the folders of one repository selected by `filter` and fire
    /// callbacks for those whose version refs changed. Returns how many
    /// callbacks fired.
    pub async fn refresh(
        &self,
        repo_key: &str,
        filter: impl Fn(&str) -> bool + Send,
    ) -> std::result::Result<usize, AggregateError<GitSourceError>> {
        let (repo, adapter, paths) = {
            let watches = self.watches.lock().await;
            let Some(watch) = watches.get(repo_key) else {
                debug!("Change signal for unwatched repository {}", repo_key);
                return Ok(0);
            };
            let mut paths: Vec<String> = watch
                .entries
                .iter()
                .map(|e| e.path.clone())
                .filter(|p| filter(p.as_str()))
                .collect();
            paths.sort();
            paths.dedup();
            (watch.repo.clone(), watch.adapter.clone(), paths)
        };

        let mut fresh = HashMap::new();
        let mut errors = Vec::new();
        for path in paths {
            match adapter.retrieve_version_refs(&repo, &path).await {
                Ok(versions) => {
                    fresh.insert(path, versions);
                }
                Err(e) => {
                    warn!(repo = %repo, path = %path, error = %e, "failed to refresh versions");
                    errors.push(e);
                }
            }
        }

        let mut changed = Vec::new();
        {
            let mut watches = self.watches.lock().await;
            if let Some(watch) = watches.get_mut(repo_key) {
                for entry in &mut watch.entries {
                    let Some(after) = fresh.get(&entry.path) else {
                        continue;
                    };
                    if *after != entry.versions {
                        let before = std::mem::replace(&mut entry.versions, after.clone());
                        changed.push((entry.callback.clone(), before, after.clone()));
                    }
                }
            }
        }

        for (callback, before, after) in &changed {
            callback(before, after);
        }
        if !changed.is_empty() {
            info!(repo = %repo, changed = changed.len(), "versions changed");
        }
        AggregateError::new(errors).into_result().map(|()| changed.len())
    }

    /// Authenticate and triage a push delivery for the repository whose
    /// `hook_id` matches. Returns how many watched folders changed.
    pub async fn handle_webhook(&self, hook_id: &str, signature: &str, body: &[u8]) -> Result<usize> {
        verify_signature(&self.hook_secret, signature, body)?;
        let payload = PushPayload::parse(body)?;

        let key = {
            let watches = self.watches.lock().await;
            watches
                .iter()
                .find(|(_, w)| w.repo.hook_id() == hook_id)
                .map(|(key, _)| key.clone())
        };
        let Some(key) = key else {
            return Err(GitSourceError::NotFound(format!("webhook {hook_id}")));
        };

        debug!(hook = hook_id, git_ref = %payload.git_ref, "push received");
        match self.refresh(&key, |path| payload.impacts(path)).await {
            Ok(changed) => Ok(changed),
            Err(aggregate) => {
                for e in &aggregate.errors {
                    warn!(hook = hook_id, error = %e, "webhook refresh failed");
                }
                Err(GitSourceError::Aggregate(aggregate))
            }
        }
    }

    /// Process adapter change signals until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let taken = {
            let mut guard = self.signal_rx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(mut signals) = taken else {
            warn!("Tracker signal loop already running");
            return;
        };

        loop {
            tokio::select! {
                key = signals.recv() => {
                    let Some(key) = key else { break };
                    if let Err(aggregate) = self.refresh(&key, |_| true).await {
                        for e in &aggregate.errors {
                            warn!("Refresh of {} failed: {}", key, e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Tracker shutting down");
                    break;
                }
            }
        }
    }

    /// Remove every adapter watch.
    pub async fn close(&self) {
        let mut watches = self.watches.lock().await;
        for (_, watch) in watches.drain() {
            if let Err(e) = watch.adapter.remove_watch(&watch.repo, &watch.handle).await {
                warn!(repo = %watch.repo, error = %e, "failed to remove watch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeAdapter;
    use crate::webhook::sign_payload;
    use std::time::Duration;

    fn refs(entries: &[(&str, &[&str])]) -> RefMap {
        entries
            .iter()
            .map(|(sha, names)| (sha.to_string(), names.iter().map(|n| n.to_string()).collect()))
            .collect()
    }

    type Seen = Arc<std::sync::Mutex<Vec<(RefMap, RefMap)>>>;

    fn recorder() -> (Seen, WatchCallback) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let callback: WatchCallback = Arc::new(move |before: &RefMap, after: &RefMap| {
            sink.lock().unwrap().push((before.clone(), after.clone()));
        });
        (seen, callback)
    }

    fn repo() -> RepoRef {
        RepoRef::hosted("https://github.com/acme/docs")
    }

    #[tokio::test]
    async fn folders_share_one_adapter_watch() {
        let fake = Arc::new(FakeAdapter::default());
        let tracker = GitSourceTracker::new(vec![fake.clone()], "secret");
        let (_, cb) = recorder();

        let a = tracker.watch_folder(&repo(), "sheets", cb.clone()).await.unwrap();
        tracker.watch_folder(&repo(), "/docs/", cb).await.unwrap();
        assert_eq!(fake.install_count(), 1);
        assert_eq!(tracker.watched_paths(&repo()).await, vec!["sheets", "docs"]);

        assert!(tracker.unwatch(&repo(), a).await.unwrap());
        assert_eq!(fake.remove_count(), 0);
        assert!(tracker.unwatch_folder(&repo(), "docs").await.unwrap());
        assert_eq!(fake.remove_count(), 1);
        assert!(!tracker.is_watching(&repo()).await);
        assert!(!tracker.unwatch_folder(&repo(), "docs").await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_repo_is_rejected() {
        let tracker = GitSourceTracker::new(vec![Arc::new(FakeAdapter::default())], "secret");
        let (_, cb) = recorder();
        let err = tracker
            .watch_folder(&RepoRef::local("/srv/git/x"), "", cb)
            .await
            .unwrap_err();
        assert!(matches!(err, GitSourceError::Unsupported(_)));
    }

    #[tokio::test]
    async fn signals_fire_callbacks_only_on_change() {
        let fake = Arc::new(FakeAdapter::default());
        fake.set_versions("sheets", refs(&[("c1", &["heads/main"])]));
        let tracker = Arc::new(GitSourceTracker::new(vec![fake.clone()], "secret"));
        let (seen, cb) = recorder();
        tracker.watch_folder(&repo(), "sheets", cb).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.run(shutdown_rx).await }
        });

        // Unchanged refs: no callback.
        fake.signal(&repo());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());

        fake.set_versions("sheets", refs(&[("c2", &["heads/main"]), ("c1", &["tags/v1"])]));
        fake.signal(&repo());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, refs(&[("c1", &["heads/main"])]));
        assert_eq!(seen[0].1["c2"], vec!["heads/main".to_string()]);

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature_and_triages_paths() {
        let fake = Arc::new(FakeAdapter::default());
        let tracker = GitSourceTracker::new(vec![fake.clone()], "secret");
        let (seen, cb) = recorder();
        tracker.watch_folder(&repo(), "sheets", cb).await.unwrap();
        fake.set_versions("sheets", refs(&[("c9", &["heads/main"])]));

        let elsewhere = br#"{"commits":[{"added":[],"removed":[],"modified":["README.md"]}]}"#;
        let sig = sign_payload("secret", elsewhere).unwrap();
        assert_eq!(
            tracker.handle_webhook(&repo().hook_id(), &sig, elsewhere).await.unwrap(),
            0
        );

        let forged = sign_payload("wrong", elsewhere).unwrap();
        let err = tracker
            .handle_webhook(&repo().hook_id(), &forged, elsewhere)
            .await
            .unwrap_err();
        assert!(matches!(err, GitSourceError::Webhook(_)));

        let relevant = br#"{"commits":[{"added":["sheets/b.csv"],"removed":[],"modified":[]}]}"#;
        let sig = sign_payload("secret", relevant).unwrap();
        assert_eq!(
            tracker.handle_webhook(&repo().hook_id(), &sig, relevant).await.unwrap(),
            1
        );
        assert_eq!(seen.lock().unwrap().len(), 1);

        let unknown = tracker.handle_webhook("0000000000000000", &sig, relevant).await;
        assert!(matches!(unknown, Err(GitSourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn webhook_reports_every_failed_folder() {
        let fake = Arc::new(FakeAdapter::default());
        let tracker = GitSourceTracker::new(vec![fake.clone()], "secret");
        let (_, sheets) = recorder();
        let (_, posts) = recorder();
        tracker.watch_folder(&repo(), "sheets", sheets).await.unwrap();
        tracker.watch_folder(&repo(), "posts", posts).await.unwrap();

        fake.fail_versions(Some(502));
        let created = br#"{"ref":"refs/heads/feature","created":true,"commits":[]}"#;
        let sig = sign_payload("secret", created).unwrap();
        let err = tracker
            .handle_webhook(&repo().hook_id(), &sig, created)
            .await
            .unwrap_err();
        match err {
            GitSourceError::Aggregate(aggregate) => {
                assert_eq!(aggregate.len(), 2);
                assert!(aggregate.errors.iter().all(|e| e.status() == Some(502)));
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_teardown_is_retried_on_next_unwatch() {
        let fake = Arc::new(FakeAdapter::default());
        let tracker = GitSourceTracker::new(vec![fake.clone()], "secret");
        let (_, cb) = recorder();
        tracker.watch_folder(&repo(), "sheets", cb).await.unwrap();

        fake.fail_removes(Some(502));
        assert!(tracker.unwatch_folder(&repo(), "sheets").await.is_err());
        assert!(tracker.is_watching(&repo()).await);

        fake.fail_removes(None);
        assert!(!tracker.unwatch_folder(&repo(), "sheets").await.unwrap());
        assert!(!tracker.is_watching(&repo()).await);
    }
}
