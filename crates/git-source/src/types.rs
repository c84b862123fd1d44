use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Commit sha -> ref names (`heads/<branch>`, `tags/<tag>`) whose latest
/// relevant commit is that sha.
pub type RefMap = BTreeMap<String, Vec<String>>;

/// A branch or tag tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefHead {
    /// `heads/<branch>` or `tags/<tag>`.
    pub name: String,
    pub sha: String,
}

impl RefHead {
    pub fn branch(name: &str, sha: impl Into<String>) -> Self {
        Self {
            name: format!("heads/{name}"),
            sha: sha.into(),
        }
    }

    pub fn tag(name: &str, sha: impl Into<String>) -> Self {
        Self {
            name: format!("tags/{name}"),
            sha: sha.into(),
        }
    }
}

/// A commit with its ancestry, as listed by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNode {
    pub sha: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub author: String,
    pub email: String,
    pub date: Option<DateTime<Utc>>,
    pub message: String,
}

/// One version of a tracked path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitVersion {
    pub sha: String,
    pub author: String,
    pub email: String,
    pub date: Option<DateTime<Utc>>,
    pub message: String,
}

impl From<CommitNode> for CommitVersion {
    fn from(node: CommitNode) -> Self {
        Self {
            sha: node.sha,
            author: node.author,
            email: node.email,
            date: node.date,
            message: node.message,
        }
    }
}

/// Strip leading/trailing slashes; the repository root becomes `""`.
pub fn normalize_path(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}
