use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::entry::{CacheEntry, HEADER_LEN, is_cache_file_name, parse_cache_header};
use crate::error::{Result, SweepError};
use crate::matcher::{Criterion, Matcher};

type CriterionId = u64;

/// Purges reverse-proxy cache entries. At most one directory walk runs at a
/// time; purges issued while it runs join it.
#[derive(Clone)]
pub struct CacheSweeper {
    inner: Arc<SweeperInner>,
}

struct SweeperInner {
    root: PathBuf,
    inflight: Mutex<Option<Arc<Sweep>>>,
    next_id: AtomicU64,
    #[cfg(test)]
    walks: AtomicU64,
}

struct Sweep {
    state: Mutex<SweepState>,
    done: watch::Sender<Option<Arc<Vec<Removed>>>>,
}

#[derive(Default)]
struct SweepState {
    criteria: Vec<(CriterionId, Criterion)>,
    entries: Vec<Discovered>,
}

struct Discovered {
    entry: CacheEntry,
    matched_by: Vec<CriterionId>,
}

struct Removed {
    entry: CacheEntry,
    matched_by: Vec<CriterionId>,
}

impl Sweep {
    fn new() -> Self {
        let (done, _) = watch::channel(None);
        Self {
            state: Mutex::new(SweepState::default()),
            done,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SweepState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a criterion, applying it to entries found so far.
    fn add_criterion(&self, id: CriterionId, criterion: Criterion) {
        let mut state = self.lock();
        for found in &mut state.entries {
            if criterion.matches(&found.entry) {
                found.matched_by.push(id);
            }
        }
        state.criteria.push((id, criterion));
    }

    fn record(&self, entry: CacheEntry) {
        let mut state = self.lock();
        let matched_by: Vec<CriterionId> = state
            .criteria
            .iter()
            .filter(|(_, c)| c.matches(&entry))
            .map(|(id, _)| *id)
            .collect();
        state.entries.push(Discovered { entry, matched_by });
    }

    fn take_matched(&self) -> Vec<Discovered> {
        let mut state = self.lock();
        std::mem::take(&mut state.entries)
            .into_iter()
            .filter(|d| !d.matched_by.is_empty())
            .collect()
    }
}

impl CacheSweeper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(SweeperInner {
                root: root.into(),
                inflight: Mutex::new(None),
                next_id: AtomicU64::new(1),
                #[cfg(test)]
                walks: AtomicU64::new(0),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Remove every cached response of `hostname` whose path `matcher`
    /// selects, returning what was removed for this criterion.
    pub async fn purge(&self, hostname: &str, matcher: Matcher) -> Result<Vec<CacheEntry>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let criterion = Criterion::new(hostname, matcher);

        let (sweep, leader) = {
            let mut inflight = self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.as_ref() {
                Some(sweep) => {
                    sweep.add_criterion(id, criterion);
                    (sweep.clone(), false)
                }
                None => {
                    let sweep = Arc::new(Sweep::new());
                    sweep.add_criterion(id, criterion);
                    *inflight = Some(sweep.clone());
                    (sweep, true)
                }
            }
        };

        let mut done = sweep.done.subscribe();
        if leader {
            debug!(hostname, "starting cache sweep");
            tokio::spawn(run_sweep(self.inner.clone(), sweep.clone()));
        } else {
            debug!(hostname, "joining in-flight cache sweep");
        }

        let removed = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SweepError::Aborted)?
            .clone()
            .ok_or(SweepError::Aborted)?;

        Ok(removed
            .iter()
            .filter(|r| r.matched_by.contains(&id))
            .map(|r| r.entry.clone())
            .collect())
    }
}

async fn run_sweep(inner: Arc<SweeperInner>, sweep: Arc<Sweep>) {
    #[cfg(test)]
    inner.walks.fetch_add(1, Ordering::SeqCst);
    walk(&inner.root, |entry| sweep.record(entry)).await;

    // New purges from here on start their own walk.
    {
        let mut inflight = inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight.as_ref().is_some_and(|s| Arc::ptr_eq(s, &sweep)) {
            *inflight = None;
        }
    }

    let matched = sweep.take_matched();
    let mut removed = Vec::with_capacity(matched.len());
    for found in matched {
        match tokio::fs::remove_file(&found.entry.file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove cache file {}: {}", found.entry.file.display(), e);
                continue;
            }
        }
        removed.push(Removed {
            entry: found.entry,
            matched_by: found.matched_by,
        });
    }

    info!(removed = removed.len(), root = %inner.root.display(), "cache sweep finished");
    sweep.done.send_replace(Some(Arc::new(removed)));
}

/// Every parseable cache entry under `root`.
pub async fn scan(root: &Path) -> Vec<CacheEntry> {
    let mut entries = Vec::new();
    walk(root, |entry| entries.push(entry)).await;
    entries
}

async fn walk(root: &Path, mut on_entry: impl FnMut(CacheEntry)) {
    let mut stack = vec![root.to_path_buf()];
    let mut reported = HashSet::new();

    while let Some(dir) = stack.pop() {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache directory {} does not exist", dir.display());
                continue;
            }
            Err(e) => {
                warn!("Failed to read cache directory {}: {}", dir.display(), e);
                continue;
            }
        };

        loop {
            let item = match read_dir.next_entry().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to list {}: {}", dir.display(), e);
                    break;
                }
            };
            let path = item.path();
            let Ok(file_type) = item.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            let is_candidate = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_cache_file_name);
            if !file_type.is_file() || !is_candidate {
                continue;
            }

            match read_entry(&path).await {
                Ok(entry) => on_entry(entry),
                Err(e) => {
                    let message = e.to_string();
                    if reported.insert(message.clone()) {
                        warn!("Skipping cache file {}: {}", path.display(), message);
                    }
                }
            }
        }
    }
}

async fn read_entry(path: &Path) -> Result<CacheEntry> {
    let io_err = |source| SweepError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let metadata = file.metadata().await.map_err(io_err)?;
    let mut head = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64)
        .read_to_end(&mut head)
        .await
        .map_err(io_err)?;

    let header = parse_cache_header(&head)?;
    Ok(CacheEntry {
        hostname: header.hostname,
        path: header.path,
        status: header.status,
        size: metadata.len(),
        mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        file: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache_name(i: usize, salt: u8) -> String {
        format!("{:02x}{:030x}", salt, i)
    }

    fn write_entry(dir: &Path, name: &str, key: &str, status: u16) {
        let mut bytes = vec![5u8, 0, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(
            format!("\nKEY: {key}\nHTTP/1.1 {status} OK\r\nContent-Type: text/html\r\n\r\n<html>").as_bytes(),
        );
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    fn populate(dir: &Path) {
        for i in 0..100 {
            write_entry(dir, &cache_name(i, 0xd0), &format!("duck.test/page/{i}"), 200);
        }
        for i in 0..50 {
            write_entry(dir, &cache_name(i, 0xc0), &format!("chicken.test/page/{i}"), 200);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_purges_remove_both_hosts() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let sweeper = CacheSweeper::new(tmp.path());

        let first = tokio::spawn({
            let sweeper = sweeper.clone();
            async move { sweeper.purge("duck.test", Matcher::Any).await }
        });
        tokio::time::sleep(Duration::from_millis(25)).await;
        let second = sweeper.purge("chicken.test", Matcher::Any).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.len(), 100);
        assert!(first.iter().all(|e| e.hostname == "duck.test"));
        assert_eq!(second.len(), 50);
        assert!(second.iter().all(|e| e.hostname == "chicken.test"));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn second_purge_joins_in_flight_walk() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let sweeper = CacheSweeper::new(tmp.path());

        // Both calls register before the spawned walk gets polled.
        let (ducks, chickens) = tokio::join!(
            sweeper.purge("duck.test", Matcher::Any),
            sweeper.purge("chicken.test", Matcher::Any),
        );
        let (ducks, chickens) = (ducks.unwrap(), chickens.unwrap());

        assert_eq!(sweeper.inner.walks.load(Ordering::SeqCst), 1);
        assert_eq!(ducks.len(), 100);
        assert!(ducks.iter().all(|e| e.hostname == "duck.test"));
        assert_eq!(chickens.len(), 50);
        assert!(chickens.iter().all(|e| e.hostname == "chicken.test"));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);

        // The finished sweep is released; the next purge walks again.
        assert!(sweeper.purge("duck.test", Matcher::Any).await.unwrap().is_empty());
        assert_eq!(sweeper.inner.walks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn purge_selects_paths_and_leaves_the_rest() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("f").join("3a");
        std::fs::create_dir_all(&nested).unwrap();
        write_entry(&nested, &cache_name(1, 0xaa), "a.test/page", 200);
        write_entry(&nested, &cache_name(2, 0xaa), "a.test/page/", 200);
        write_entry(tmp.path(), &cache_name(3, 0xaa), "b.test/page", 404);

        let sweeper = CacheSweeper::new(tmp.path());
        let removed = sweeper
            .purge("a.test", Matcher::Exact("/page".into()))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].path, "/page");
        assert!(!removed[0].file.exists());

        let left = scan(tmp.path()).await;
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|e| e.hostname == "b.test" && e.status == 404));
    }

    #[tokio::test]
    async fn scan_skips_foreign_and_corrupt_files() {
        let tmp = TempDir::new().unwrap();
        write_entry(tmp.path(), &cache_name(1, 0x11), "a.test/ok", 200);
        write_entry(tmp.path(), &cache_name(2, 0x11), "http://a.test/bad", 200);
        std::fs::write(tmp.path().join(cache_name(3, 0x11)), b"no header here").unwrap();
        write_entry(tmp.path(), "not-a-cache-file", "a.test/ignored", 200);

        let entries = scan(tmp.path()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/ok");
        assert!(entries[0].size > 0);
    }

    #[tokio::test]
    async fn missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let sweeper = CacheSweeper::new(tmp.path().join("absent"));
        assert!(sweeper.purge("a.test", Matcher::Any).await.unwrap().is_empty());
    }

    #[test]
    fn late_criteria_apply_to_discovered_entries() {
        let sweep = Sweep::new();
        sweep.add_criterion(1, Criterion::new("duck.test", Matcher::Any));
        let entry = |host: &str| CacheEntry {
            hostname: host.into(),
            path: "/".into(),
            status: 200,
            size: 1,
            mtime: SystemTime::UNIX_EPOCH,
            file: PathBuf::from(format!("/tmp/{host}")),
        };
        sweep.record(entry("duck.test"));
        sweep.record(entry("chicken.test"));
        sweep.add_criterion(2, Criterion::new("chicken.test", Matcher::Any));
        sweep.record(entry("chicken.test"));

        let matched = sweep.take_matched();
        assert_eq!(matched.len(), 3);
        assert_eq!(matched[0].matched_by, vec![1]);
        assert_eq!(matched[1].matched_by, vec![2]);
        assert_eq!(matched[2].matched_by, vec![2]);
    }
}
