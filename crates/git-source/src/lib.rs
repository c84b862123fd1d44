pub mod adapter;
pub mod error;
pub mod github;
pub mod local;
pub mod reconcile;
pub mod refs;
pub mod tracker;
pub mod types;
pub mod webhook;

#[cfg(test)]
pub(crate) mod test_utils;

pub use adapter::{ChangeSender, SourceAdapter, WatchHandle};
pub use error::{GitSourceError, Result};
pub use github::{GitHubAdapter, GitHubConfig};
pub use local::LocalGitAdapter;
pub use reconcile::{RetryPolicy, SourceChange, WatchReconciler, WatchTarget, desired_targets};
pub use refs::{canonical_ref, resolve_version_refs};
pub use tracker::{GitSourceTracker, WatchCallback, WatchId};
pub use types::{CommitNode, CommitVersion, RefHead, RefMap};
pub use webhook::{PushPayload, derive_hook_secret, sign_payload, verify_signature};
