use async_trait::async_trait;
use notify::RecommendedWatcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use trove_core::RepoRef;

use crate::error::Result;
use crate::refs::resolve_version_refs;
use crate::types::{CommitNode, CommitVersion, RefHead, RefMap};

/// Adapters push the key of a repository whose refs may have moved.
pub type ChangeSender = mpsc::UnboundedSender<String>;

/// Whatever an adapter installed to learn about ref changes.
pub enum WatchHandle {
    /// A push webhook registered upstream. Deliveries arrive through
    /// [`crate::GitSourceTracker::handle_webhook`].
    Webhook { id: u64 },
    /// A filesystem watch on the repository's refs; dropped to stop.
    Filesystem(FsWatch),
    /// Nothing to tear down.
    Passive,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Webhook { id } => f.debug_struct("Webhook").field("id", id).finish(),
            Self::Filesystem(_) => f.write_str("Filesystem"),
            Self::Passive => f.write_str("Passive"),
        }
    }
}

pub struct FsWatch {
    pub(crate) _watcher: RecommendedWatcher,
    pub(crate) debounce: JoinHandle<()>,
}

impl Drop for FsWatch {
    fn drop(&mut self) {
        self.debounce.abort();
    }
}

/// One git backend (hosted API, local working copy, ...).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, repo: &RepoRef) -> bool;

    /// Raw bytes of `path` at `reference` (default branch when `None`).
    async fn retrieve_file(
        &self,
        repo: &RepoRef,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Vec<u8>>;

    async fn get_default_branch(&self, repo: &RepoRef) -> Result<String>;

    async fn list_heads(&self, repo: &RepoRef) -> Result<Vec<RefHead>>;

    /// Commits touching `path` across all refs, newest first. `None` or an
    /// empty path lists the whole history.
    async fn list_commits(&self, repo: &RepoRef, path: Option<&str>) -> Result<Vec<CommitNode>>;

    async fn install_watch(&self, repo: &RepoRef, signal: ChangeSender) -> Result<WatchHandle>;

    async fn remove_watch(&self, repo: &RepoRef, handle: &WatchHandle) -> Result<()>;

    async fn retrieve_versions(&self, repo: &RepoRef, path: &str) -> Result<Vec<CommitVersion>> {
        let commits = self.list_commits(repo, Some(path)).await?;
        Ok(commits.into_iter().map(CommitVersion::from).collect())
    }

    async fn retrieve_version_refs(&self, repo: &RepoRef, path: &str) -> Result<RefMap> {
        let heads = self.list_heads(repo).await?;
        let relevant = self.list_commits(repo, Some(path)).await?;
        let recent = self.list_commits(repo, None).await?;
        Ok(resolve_version_refs(&heads, &relevant, &recent))
    }
}
