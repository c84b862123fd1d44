//! Timers that delete derived content once its metadata `etime` passes.
//!
//! Each `(scope, hash)` pair has at most one watch. Watches are created from a
//! startup scan of existing sidecars and afterwards purely from [`MetaEvent`]s.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ContentStore, MetaEvent, RemoveOptions};

/// A content folder whose sidecars are scanned at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryTarget {
    pub scope: String,
    pub folder: String,
}

type WatchKey = (String, String);

struct Watch {
    etime: DateTime<Utc>,
    generation: u64,
    timer: JoinHandle<()>,
}

struct SchedulerInner {
    store: ContentStore,
    watches: Mutex<HashMap<WatchKey, Watch>>,
    generation: AtomicU64,
}

impl SchedulerInner {
    fn watches(&self) -> MutexGuard<'_, HashMap<WatchKey, Watch>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct ExpirationScheduler {
    inner: Arc<SchedulerInner>,
}

impl ExpirationScheduler {
    pub fn new(store: ContentStore) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                watches: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule every existing sidecar that carries an `etime`.
    /// Returns the number of watches created.
    pub async fn start(&self, targets: &[ExpiryTarget]) -> usize {
        let mut scheduled = 0;
        for target in targets {
            let hashes = match self.inner.store.list_meta(&target.folder).await {
                Ok(hashes) => hashes,
                Err(e) => {
                    warn!("Failed to scan metadata in {}: {}", target.folder, e);
                    continue;
                }
            };
            for hash in hashes {
                let Some(meta) = self.inner.store.find_meta(&target.folder, &hash).await else {
                    continue;
                };
                match parse_etime(&meta) {
                    Some(etime) if etime > Utc::now() => {
                        self.schedule(&target.scope, &target.folder, &hash, etime);
                        scheduled += 1;
                    }
                    Some(etime) => debug!("Skipping {}/{}: etime {} already passed", target.scope, hash, etime),
                    None => {}
                }
            }
        }
        info!("Expiration scan scheduled {scheduled} timer(s)");
        scheduled
    }

    /// Consume metadata events until shutdown, then cancel every timer.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<MetaEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Expiration scheduler missed {missed} metadata event(s)");
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Expiration scheduler shutting down");
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    /// React to a metadata save or removal. Only an `etime` still in the
    /// future keeps or creates a watch.
    pub fn handle_event(&self, event: &MetaEvent) {
        let key = (event.scope.clone(), event.hash.clone());
        let etime = event
            .meta
            .as_ref()
            .and_then(parse_etime)
            .filter(|etime| *etime > Utc::now());
        let current = self.inner.watches().get(&key).map(|w| w.etime);

        match (current, etime) {
            (None, Some(etime)) => self.schedule(&event.scope, &event.folder, &event.hash, etime),
            (Some(old), Some(etime)) if old != etime => {
                debug!("Rescheduling {}/{}: {} -> {}", event.scope, event.hash, old, etime);
                self.schedule(&event.scope, &event.folder, &event.hash, etime);
            }
            (Some(_), None) => {
                self.cancel(&event.scope, &event.hash);
            }
            _ => {}
        }
    }

    /// Create or replace the watch for `(scope, hash)`. An `etime` already in
    /// the past fires on the next scheduler tick; callers reacting to
    /// metadata filter those out first.
    pub fn schedule(&self, scope: &str, folder: &str, hash: &str, etime: DateTime<Utc>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let delay = (etime - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let weak = Arc::downgrade(&self.inner);
        let key = (scope.to_string(), hash.to_string());

        // Spawn under the lock so `fire` cannot look the watch up before it
        // is inserted.
        let mut watches = self.inner.watches();
        let timer = {
            let key = key.clone();
            let folder = folder.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                fire(weak, key, folder, etime, generation).await;
            })
        };
        let previous = watches.insert(
            key,
            Watch {
                etime,
                generation,
                timer,
            },
        );
        drop(watches);
        if let Some(previous) = previous {
            previous.timer.abort();
        }
        debug!("Scheduled expiry of {scope}/{hash} at {etime}");
    }

    /// Drop the watch for `(scope, hash)`. Returns whether one existed.
    pub fn cancel(&self, scope: &str, hash: &str) -> bool {
        let removed = self
            .inner
            .watches()
            .remove(&(scope.to_string(), hash.to_string()));
        match removed {
            Some(watch) => {
                watch.timer.abort();
                debug!("Cancelled expiry of {scope}/{hash}");
                true
            }
            None => false,
        }
    }

    pub fn scheduled_etime(&self, scope: &str, hash: &str) -> Option<DateTime<Utc>> {
        self.inner
            .watches()
            .get(&(scope.to_string(), hash.to_string()))
            .map(|w| w.etime)
    }

    pub fn is_scheduled(&self, scope: &str, hash: &str) -> bool {
        self.scheduled_etime(scope, hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.watches().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every pending timer.
    pub fn shutdown(&self) {
        let drained: Vec<Watch> = self.inner.watches().drain().map(|(_, w)| w).collect();
        for watch in &drained {
            watch.timer.abort();
        }
        if !drained.is_empty() {
            debug!("Cancelled {} expiry timer(s)", drained.len());
        }
    }
}

async fn fire(
    inner: Weak<SchedulerInner>,
    key: WatchKey,
    folder: String,
    etime: DateTime<Utc>,
    generation: u64,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    {
        let mut watches = inner.watches();
        match watches.get(&key) {
            Some(watch) if watch.generation == generation => {
                watches.remove(&key);
            }
            // Superseded by a reschedule or cancelled.
            _ => return,
        }
    }

    let (scope, hash) = key;
    if !sidecar_expires_at(&inner, &folder, &hash, etime, true).await {
        debug!("Sidecar of {scope}/{hash} was rewritten; not expiring");
        return;
    }
    info!("Content {scope}/{hash} expired, removing");
    match inner.store.remove_artifacts(&folder, &hash).await {
        Ok(count) => debug!("Removed {count} artifact(s) for {hash}"),
        Err(e) => warn!("Failed to remove expired artifacts for {hash}: {e}"),
    }
    // A producer may have written a fresh sidecar while artifacts were removed.
    if !sidecar_expires_at(&inner, &folder, &hash, etime, false).await {
        debug!("Sidecar of {scope}/{hash} was rewritten; keeping it");
        return;
    }
    if let Err(e) = inner
        .store
        .remove_meta(&scope, &folder, &hash, RemoveOptions::default())
        .await
    {
        warn!("Failed to remove expired metadata for {hash}: {e}");
    }
}

/// Whether the sidecar on disk still carries `etime`. A missing sidecar
/// counts as expired only when `missing_ok` is set.
async fn sidecar_expires_at(
    inner: &SchedulerInner,
    folder: &str,
    hash: &str,
    etime: DateTime<Utc>,
    missing_ok: bool,
) -> bool {
    match inner.store.find_meta(folder, hash).await {
        Some(meta) => parse_etime(&meta) == Some(etime),
        None => missing_ok,
    }
}

/// `etime` as an RFC 3339 string or epoch milliseconds.
pub fn parse_etime(meta: &Value) -> Option<DateTime<Utc>> {
    match meta.get("etime")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
