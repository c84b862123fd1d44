//! Hash-addressed storage for derived content.
//!
//! Layout is `<root>/<folder>/<hash>` or `<root>/<folder>/<hash>.<ext>`, with a
//! pretty-printed JSON sidecar at `<root>/<folder>/<hash>.meta.json`.
//!
//! Every write is registered in an in-memory queue before the file is touched
//! and stays there until the write finished, so a `load` issued after a `save`
//! began always sees the saved bytes even when the file is still incomplete.

use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use trove_core::is_valid_hash;

use crate::error::{Result, StoreError};

const META_SUFFIX: &str = ".meta.json";
const EVENT_CAPACITY: usize = 1024;

/// What a content hash was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hashed {
    /// Hash of a source identifier; the bytes behind it may legitimately change.
    #[default]
    Source,
    /// Hash of the bytes themselves; an existing entry of the same size is
    /// assumed identical and the write is skipped.
    Content,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    pub hashed: Hashed,
}

impl SaveOptions {
    pub fn content_hashed() -> Self {
        Self {
            hashed: Hashed::Content,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RemoveOptions {
    /// Swallow removal failures (missing file included).
    pub ignore_error: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self { ignore_error: true }
    }
}

impl RemoveOptions {
    pub fn strict() -> Self {
        Self {
            ignore_error: false,
        }
    }
}

/// Emitted whenever a metadata sidecar is saved or removed (`meta: None`).
#[derive(Debug, Clone, PartialEq)]
pub struct MetaEvent {
    pub scope: String,
    pub folder: String,
    pub hash: String,
    pub meta: Option<Value>,
}

struct PendingWrite {
    id: u64,
    path: PathBuf,
    bytes: Arc<[u8]>,
}

#[derive(Default)]
struct WriteQueue {
    next_id: u64,
    pending: Vec<PendingWrite>,
}

struct Inner {
    root: PathBuf,
    queue: Mutex<WriteQueue>,
    events: broadcast::Sender<MetaEvent>,
}

/// Removes its entry from the write queue when dropped, including on error paths.
struct InFlight<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.queue().pending.retain(|w| w.id != self.id);
    }
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, WriteQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_write(&self, path: PathBuf, bytes: Arc<[u8]>) -> InFlight<'_> {
        let mut queue = self.queue();
        let id = queue.next_id;
        queue.next_id += 1;
        queue.pending.push(PendingWrite { id, path, bytes });
        InFlight { inner: self, id }
    }

    /// Most recent in-flight buffer for `path`.
    fn in_flight(&self, path: &Path) -> Option<Arc<[u8]>> {
        self.queue()
            .pending
            .iter()
            .rev()
            .find(|w| w.path == path)
            .map(|w| Arc::clone(&w.bytes))
    }
}

/// Shared handle to the content store. Cloning is cheap.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<Inner>,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                queue: Mutex::new(WriteQueue::default()),
                events,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Receive metadata save/remove events.
    pub fn subscribe(&self) -> broadcast::Receiver<MetaEvent> {
        self.inner.events.subscribe()
    }

    /// Deterministic location of a content entry.
    pub fn content_path(&self, folder: &str, hash: &str, ext: Option<&str>) -> Result<PathBuf> {
        let dir = self.folder_path(folder)?;
        validate_hash(hash)?;
        let name = match ext {
            Some(ext) => {
                if ext.is_empty() || ext.contains(['/', '\\']) {
                    return Err(StoreError::InvalidHash(format!("{hash}.{ext}")));
                }
                format!("{hash}.{ext}")
            }
            None => hash.to_string(),
        };
        Ok(dir.join(name))
    }

    pub fn meta_path(&self, folder: &str, hash: &str) -> Result<PathBuf> {
        let dir = self.folder_path(folder)?;
        validate_hash(hash)?;
        Ok(dir.join(format!("{hash}{META_SUFFIX}")))
    }

    fn folder_path(&self, folder: &str) -> Result<PathBuf> {
        let rel = Path::new(folder);
        let well_formed = !folder.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            return Err(StoreError::InvalidFolder(folder.to_string()));
        }
        Ok(self.inner.root.join(rel))
    }

    /// Write `bytes` for `hash`, returning the final path.
    pub async fn save(
        &self,
        folder: &str,
        hash: &str,
        ext: Option<&str>,
        bytes: impl Into<Arc<[u8]>>,
        opts: SaveOptions,
    ) -> Result<PathBuf> {
        let path = self.content_path(folder, hash, ext)?;
        let bytes: Arc<[u8]> = bytes.into();

        if opts.hashed == Hashed::Content && self.has_same_length(&path, bytes.len()).await {
            debug!("Content already present, skipping write: {}", path.display());
            return Ok(path);
        }

        self.write(&path, bytes).await?;
        Ok(path)
    }

    async fn write(&self, path: &Path, bytes: Arc<[u8]>) -> Result<()> {
        let _in_flight = self.inner.begin_write(path.to_path_buf(), Arc::clone(&bytes));
        write_file(path, &bytes).await
    }

    async fn has_same_length(&self, path: &Path, len: usize) -> bool {
        if let Some(pending) = self.inner.in_flight(path) {
            return pending.len() == len;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.is_file() && meta.len() == len as u64,
            Err(_) => false,
        }
    }

    /// Read content, preferring an in-flight write over the file on disk.
    pub async fn load(&self, folder: &str, hash: &str, ext: Option<&str>) -> Result<Vec<u8>> {
        let path = self.content_path(folder, hash, ext)?;
        read_path(&self.inner, &path).await
    }

    /// Whether content is visible, either in flight or on disk.
    pub async fn exists(&self, folder: &str, hash: &str, ext: Option<&str>) -> Result<bool> {
        let path = self.content_path(folder, hash, ext)?;
        if self.inner.in_flight(&path).is_some() {
            return Ok(true);
        }
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    pub async fn remove(
        &self,
        folder: &str,
        hash: &str,
        ext: Option<&str>,
        opts: RemoveOptions,
    ) -> Result<()> {
        let path = self.content_path(folder, hash, ext)?;
        remove_path(&path, opts).await
    }

    /// Remove every artifact stored for `hash` in `folder` (any extension),
    /// leaving the metadata sidecar alone. Returns how many files went away.
    pub async fn remove_artifacts(&self, folder: &str, hash: &str) -> Result<usize> {
        let dir = self.folder_path(folder)?;
        validate_hash(hash)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let prefix = format!("{hash}.");
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_artifact =
                name == hash || (name.starts_with(&prefix) && !name.ends_with(META_SUFFIX));
            if !is_artifact {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
        Ok(removed)
    }

    /// Persist metadata for `hash` and notify subscribers.
    pub async fn save_meta(&self, scope: &str, folder: &str, hash: &str, meta: &Value) -> Result<()> {
        let path = self.meta_path(folder, hash)?;
        let json = serde_json::to_vec_pretty(meta).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        self.write(&path, json.into()).await?;

        let _ = self.inner.events.send(MetaEvent {
            scope: scope.to_string(),
            folder: folder.to_string(),
            hash: hash.to_string(),
            meta: Some(meta.clone()),
        });
        Ok(())
    }

    pub async fn load_meta(&self, folder: &str, hash: &str) -> Result<Value> {
        let path = self.meta_path(folder, hash)?;
        let bytes = read_path(&self.inner, &path).await?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path, source })
    }

    /// Like [`load_meta`](Self::load_meta) but a missing or unreadable sidecar is `None`.
    pub async fn find_meta(&self, folder: &str, hash: &str) -> Option<Value> {
        match self.load_meta(folder, hash).await {
            Ok(meta) => Some(meta),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!("Ignoring unreadable metadata: {e}");
                None
            }
        }
    }

    pub async fn remove_meta(
        &self,
        scope: &str,
        folder: &str,
        hash: &str,
        opts: RemoveOptions,
    ) -> Result<()> {
        let path = self.meta_path(folder, hash)?;
        remove_path(&path, opts).await?;

        let _ = self.inner.events.send(MetaEvent {
            scope: scope.to_string(),
            folder: folder.to_string(),
            hash: hash.to_string(),
            meta: None,
        });
        Ok(())
    }

    /// Hashes in `folder` that own a metadata sidecar. A missing folder is empty.
    pub async fn list_meta(&self, folder: &str) -> Result<Vec<String>> {
        let dir = self.folder_path(folder)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut hashes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let name = entry.file_name();
            if let Some(hash) = name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) {
                if is_valid_hash(hash) {
                    hashes.push(hash.to_string());
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}

fn validate_hash(hash: &str) -> Result<()> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(StoreError::InvalidHash(hash.to_string()))
    }
}

async fn read_path(inner: &Inner, path: &Path) -> Result<Vec<u8>> {
    if let Some(bytes) = inner.in_flight(path) {
        return Ok(bytes.to_vec());
    }
    tokio::fs::read(path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    match tokio::fs::write(path, bytes).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::io(parent, e))?;
            }
            tokio::fs::write(path, bytes)
                .await
                .map_err(|e| StoreError::io(path, e))
        }
        Err(e) => Err(StoreError::io(path, e)),
    }
}

async fn remove_path(path: &Path, opts: RemoveOptions) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if opts.ignore_error => {
            debug!("Ignoring failed remove of {}: {}", path.display(), e);
            Ok(())
        }
        Err(e) => Err(StoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const HASH: &str = "0123456789abcdef";

    #[tokio::test]
    async fn save_and_load_use_deterministic_paths() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());

        let path = store
            .save("sheets", HASH, Some("json"), b"{}".to_vec(), SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(path, tmp.path().join("sheets").join(format!("{HASH}.json")));
        assert_eq!(store.load("sheets", HASH, Some("json")).await.unwrap(), b"{}");

        let bare = store
            .save("sheets", HASH, None, b"raw".to_vec(), SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(bare, tmp.path().join("sheets").join(HASH));
        assert!(store.exists("sheets", HASH, None).await.unwrap());
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        let err = store.load("sheets", HASH, None).await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
        assert!(!store.exists("sheets", HASH, None).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_escaping_folders_and_hashes() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        assert!(matches!(
            store.load("../outside", HASH, None).await,
            Err(StoreError::InvalidFolder(_))
        ));
        assert!(matches!(
            store.load("sheets", "not/a/hash", None).await,
            Err(StoreError::InvalidHash(_))
        ));
    }

    #[tokio::test]
    async fn content_hashed_save_skips_same_length_entry() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        let path = store.content_path("img", HASH, Some("png")).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"bbbb").unwrap();

        store
            .save("img", HASH, Some("png"), b"cccc".to_vec(), SaveOptions::content_hashed())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"bbbb");
    }

    #[tokio::test]
    async fn content_hashed_save_replaces_truncated_entry() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        let path = store.content_path("img", HASH, Some("png")).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"bb").unwrap();

        store
            .save("img", HASH, Some("png"), b"cccc".to_vec(), SaveOptions::content_hashed())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"cccc");
    }

    #[tokio::test]
    async fn source_hashed_save_always_writes() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        store
            .save("img", HASH, None, b"aaaa".to_vec(), SaveOptions::default())
            .await
            .unwrap();
        store
            .save("img", HASH, None, b"bbbb".to_vec(), SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(store.load("img", HASH, None).await.unwrap(), b"bbbb");
    }

    #[tokio::test]
    async fn load_prefers_in_flight_buffer() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        let path = store.content_path("sheets", HASH, Some("json")).unwrap();

        let guard = store
            .inner
            .begin_write(path.clone(), Arc::from(b"pending".as_slice()));
        assert!(!path.exists());
        assert_eq!(
            store.load("sheets", HASH, Some("json")).await.unwrap(),
            b"pending"
        );
        assert!(store.exists("sheets", HASH, Some("json")).await.unwrap());

        // Same-length content-hashed save joins the in-flight write.
        store
            .save("sheets", HASH, Some("json"), b"PENDING".to_vec(), SaveOptions::content_hashed())
            .await
            .unwrap();
        assert!(!path.exists());

        drop(guard);
        assert!(store.inner.queue().pending.is_empty());
        assert!(store.load("sheets", HASH, Some("json")).await.is_err());
    }

    #[tokio::test]
    async fn load_during_save_sees_full_buffer() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        let path = store.content_path("media", HASH, Some("bin")).unwrap();
        let data: Vec<u8> = (0..16 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

        let save = tokio::spawn({
            let store = store.clone();
            let data = data.clone();
            async move {
                store
                    .save("media", HASH, Some("bin"), data, SaveOptions::default())
                    .await
            }
        });
        // Let the save register itself and park on the blocking file write.
        tokio::task::yield_now().await;
        assert!(store.inner.in_flight(&path).is_some());

        let loaded = store.load("media", HASH, Some("bin")).await.unwrap();
        assert_eq!(loaded.len(), data.len());
        assert!(loaded == data);

        save.await.unwrap().unwrap();
        assert!(store.inner.queue().pending.is_empty());
        assert!(store.load("media", HASH, Some("bin")).await.unwrap() == data);
    }

    #[tokio::test]
    async fn most_recent_in_flight_write_wins() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        let path = store.content_path("sheets", HASH, None).unwrap();

        let _first = store.inner.begin_write(path.clone(), Arc::from(b"one".as_slice()));
        let _second = store.inner.begin_write(path.clone(), Arc::from(b"two".as_slice()));
        assert_eq!(store.load("sheets", HASH, None).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn meta_roundtrip_emits_events() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        let mut rx = store.subscribe();
        let meta = json!({ "source": "drive:abc", "etime": "2030-01-01T00:00:00Z" });

        store.save_meta("docs", "sheets", HASH, &meta).await.unwrap();
        assert_eq!(store.load_meta("sheets", HASH).await.unwrap(), meta);
        let on_disk = std::fs::read_to_string(store.meta_path("sheets", HASH).unwrap()).unwrap();
        assert!(on_disk.contains("\n  \"source\""), "meta should be pretty-printed");

        let saved = rx.recv().await.unwrap();
        assert_eq!(
            saved,
            MetaEvent {
                scope: "docs".into(),
                folder: "sheets".into(),
                hash: HASH.into(),
                meta: Some(meta),
            }
        );

        store
            .remove_meta("docs", "sheets", HASH, RemoveOptions::default())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().meta, None);
        assert_eq!(store.find_meta("sheets", HASH).await, None);
    }

    #[tokio::test]
    async fn remove_ignores_errors_unless_strict() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        store
            .remove("sheets", HASH, None, RemoveOptions::default())
            .await
            .unwrap();
        let err = store
            .remove("sheets", HASH, None, RemoveOptions::strict())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_meta_and_remove_artifacts() {
        let tmp = tempdir().unwrap();
        let store = ContentStore::new(tmp.path());
        assert!(store.list_meta("sheets").await.unwrap().is_empty());

        store
            .save("sheets", HASH, Some("json"), b"{}".to_vec(), SaveOptions::default())
            .await
            .unwrap();
        store
            .save("sheets", HASH, Some("html"), b"<p>".to_vec(), SaveOptions::default())
            .await
            .unwrap();
        store
            .save_meta("docs", "sheets", HASH, &json!({}))
            .await
            .unwrap();
        store
            .save("sheets", "ffff", None, b"other".to_vec(), SaveOptions::default())
            .await
            .unwrap();

        assert_eq!(store.list_meta("sheets").await.unwrap(), vec![HASH.to_string()]);
        assert_eq!(store.remove_artifacts("sheets", HASH).await.unwrap(), 2);
        assert!(!store.exists("sheets", HASH, Some("json")).await.unwrap());
        assert!(store.exists("sheets", "ffff", None).await.unwrap());
        assert!(store.find_meta("sheets", HASH).await.is_some());
    }
}
