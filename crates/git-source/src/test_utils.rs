use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

use trove_core::RepoRef;

use crate::{
    ChangeSender, CommitNode, GitSourceError, RefHead, RefMap, Result, SourceAdapter, WatchHandle,
};

/// Initialize a minimal git repository for testing.
///
/// Creates a repo with an initial commit so that HEAD exists.
pub fn init_test_repo(dir: &Path) {
    git(dir, &["init", "--initial-branch=main"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    git(dir, &["config", "tag.gpgsign", "false"]);

    std::fs::write(dir.join("README"), "test repo").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "init"]);
}

/// Run git in `dir`, panicking on failure. Returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Write `path` with `content`, commit it, and return the new HEAD sha.
pub fn commit_file(dir: &Path, path: &str, content: &str, message: &str) -> String {
    let file = dir.join(path);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&file, content).unwrap();
    git(dir, &["add", path]);
    git(dir, &["commit", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

/// In-memory adapter for tracker and reconciler tests.
#[derive(Default)]
pub struct FakeAdapter {
    versions: Mutex<HashMap<String, RefMap>>,
    installs: Mutex<Vec<Instant>>,
    removes: AtomicUsize,
    install_failure: Mutex<Option<u16>>,
    version_failure: Mutex<Option<u16>>,
    remove_failure: Mutex<Option<u16>>,
    signals: Mutex<Vec<ChangeSender>>,
}

impl FakeAdapter {
    pub fn set_versions(&self, path: &str, refs: RefMap) {
        self.versions.lock().unwrap().insert(path.to_string(), refs);
    }

    /// Make `install_watch` fail with an upstream status (`None` to succeed).
    pub fn fail_installs(&self, status: Option<u16>) {
        *self.install_failure.lock().unwrap() = status;
    }

    pub fn fail_versions(&self, status: Option<u16>) {
        *self.version_failure.lock().unwrap() = status;
    }

    pub fn fail_removes(&self, status: Option<u16>) {
        *self.remove_failure.lock().unwrap() = status;
    }

    pub fn install_times(&self) -> Vec<Instant> {
        self.installs.lock().unwrap().clone()
    }

    pub fn install_count(&self) -> usize {
        self.installs.lock().unwrap().len()
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Report a ref change for `repo` through every installed watch.
    pub fn signal(&self, repo: &RepoRef) {
        for tx in self.signals.lock().unwrap().iter() {
            let _ = tx.send(repo.key());
        }
    }
}

fn upstream(status: u16) -> GitSourceError {
    GitSourceError::Upstream {
        status,
        message: "injected".into(),
    }
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn can_handle(&self, repo: &RepoRef) -> bool {
        matches!(repo, RepoRef::Hosted { .. })
    }

    async fn retrieve_file(
        &self,
        repo: &RepoRef,
        path: &str,
        _reference: Option<&str>,
    ) -> Result<Vec<u8>> {
        Err(GitSourceError::NotFound(format!("{repo}:{path}")))
    }

    async fn get_default_branch(&self, _repo: &RepoRef) -> Result<String> {
        Ok("main".into())
    }

    async fn list_heads(&self, _repo: &RepoRef) -> Result<Vec<RefHead>> {
        Ok(Vec::new())
    }

    async fn list_commits(
        &self,
        _repo: &RepoRef,
        _path: Option<&str>,
    ) -> Result<Vec<CommitNode>> {
        Ok(Vec::new())
    }

    async fn retrieve_version_refs(
        &self,
        _repo: &RepoRef,
        path: &str,
    ) -> Result<RefMap> {
        if let Some(status) = *self.version_failure.lock().unwrap() {
            return Err(upstream(status));
        }
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    async fn install_watch(
        &self,
        _repo: &RepoRef,
        signal: ChangeSender,
    ) -> Result<WatchHandle> {
        self.installs.lock().unwrap().push(Instant::now());
        if let Some(status) = *self.install_failure.lock().unwrap() {
            return Err(upstream(status));
        }
        self.signals.lock().unwrap().push(signal);
        Ok(WatchHandle::Passive)
    }

    async fn remove_watch(
        &self,
        _repo: &RepoRef,
        _handle: &WatchHandle,
    ) -> Result<()> {
        if let Some(status) = *self.remove_failure.lock().unwrap() {
            return Err(upstream(status));
        }
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
