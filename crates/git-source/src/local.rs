//! Working-copy backend driven by the `git` binary.
//!
//! Every read shells out through `tokio::process::Command`. Ref changes are
//! picked up by a notify watch on the git directory's refs, debounced so a
//! single `git commit` (ref lock, rename, reflog) yields one signal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use trove_core::RepoRef;

use crate::adapter::{ChangeSender, FsWatch, SourceAdapter, WatchHandle};
use crate::error::{GitSourceError, Result};
use crate::types::{CommitNode, RefHead, normalize_path};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

pub struct LocalGitAdapter {
    debounce: Duration,
}

impl Default for LocalGitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalGitAdapter {
    pub fn new() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        Self { debounce }
    }

    fn repo_path<'a>(&self, repo: &'a RepoRef) -> Result<&'a Path> {
        match repo {
            RepoRef::Local { path } => Ok(path),
            RepoRef::Hosted { .. } => Err(GitSourceError::Unsupported(repo.to_string())),
        }
    }

    /// Run git in `dir`. Exit codes listed in `empty_ok` yield empty output.
    async fn git(&self, dir: &Path, args: &[&str], empty_ok: &[i32]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        if output
            .status
            .code()
            .is_some_and(|code| empty_ok.contains(&code))
        {
            return Ok(Vec::new());
        }
        Err(GitSourceError::Command {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl SourceAdapter for LocalGitAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    fn can_handle(&self, repo: &RepoRef) -> bool {
        matches!(repo, RepoRef::Local { .. })
    }

    async fn retrieve_file(
        &self,
        repo: &RepoRef,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Vec<u8>> {
        let dir = self.repo_path(repo)?;
        let spec = format!("{}:{}", reference.unwrap_or("HEAD"), normalize_path(path));
        match self.git(dir, &["show", &spec], &[]).await {
            Err(GitSourceError::Command { stderr, .. })
                if stderr.contains("does not exist")
                    || stderr.contains("not a valid object name")
                    || stderr.contains("Not a valid object name") =>
            {
                Err(GitSourceError::NotFound(format!("{repo}:{spec}")))
            }
            other => other,
        }
    }

    async fn get_default_branch(&self, repo: &RepoRef) -> Result<String> {
        let dir = self.repo_path(repo)?;
        let out = self
            .git(dir, &["rev-parse", "--symbolic-full-name", "HEAD"], &[])
            .await?;
        let full = String::from_utf8_lossy(&out).trim().to_string();
        match full.strip_prefix("refs/heads/") {
            Some(branch) => Ok(branch.to_string()),
            None => Err(GitSourceError::NotFound(format!("{repo}: HEAD is detached"))),
        }
    }

    async fn list_heads(&self, repo: &RepoRef) -> Result<Vec<RefHead>> {
        let dir = self.repo_path(repo)?;
        // show-ref exits 1 when nothing matches.
        let branches = self.git(dir, &["show-ref", "--heads"], &[1]).await?;
        let tags = self
            .git(dir, &["show-ref", "--tags", "--dereference"], &[1])
            .await?;

        let mut heads = parse_show_ref(&String::from_utf8_lossy(&branches), "refs/heads/")
            .into_iter()
            .map(|(name, sha)| RefHead::branch(&name, sha))
            .collect::<Vec<_>>();
        heads.extend(
            parse_show_ref(&String::from_utf8_lossy(&tags), "refs/tags/")
                .into_iter()
                .map(|(name, sha)| RefHead::tag(&name, sha)),
        );
        Ok(heads)
    }

    async fn list_commits(&self, repo: &RepoRef, path: Option<&str>) -> Result<Vec<CommitNode>> {
        let dir = self.repo_path(repo)?;
        let path = path.map(normalize_path).filter(|p| !p.is_empty());
        let mut args = vec![
            "log",
            "--all",
            "--topo-order",
            "--no-decorate",
            "--no-color",
            "--pretty=raw",
            "-z",
        ];
        if let Some(p) = &path {
            args.push("--");
            args.push(p.as_str());
        }
        let out = self.git(dir, &args, &[]).await?;
        let commits = parse_raw_log(&String::from_utf8_lossy(&out));
        debug!(repo = %repo, path = ?path, count = commits.len(), "listed commits");
        Ok(commits)
    }

    async fn install_watch(&self, repo: &RepoRef, signal: ChangeSender) -> Result<WatchHandle> {
        let dir = self.repo_path(repo)?;
        let git_dir = git_dir(dir);
        let refs_dir = git_dir.join("refs");

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<()>();
        let filter_refs = refs_dir.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    if event.paths.iter().any(|p| is_ref_path(p, &filter_refs)) {
                        let _ = raw_tx.send(());
                    }
                }
                Err(e) => error!("Ref watcher error: {}", e),
            }
        })?;
        watcher.watch(&refs_dir, RecursiveMode::Recursive)?;
        // packed-refs and HEAD live directly in the git dir.
        watcher.watch(&git_dir, RecursiveMode::NonRecursive)?;
        info!("Watching refs of {}", git_dir.display());

        let debounce = tokio::spawn(debounce_signals(
            raw_rx,
            repo.key(),
            signal,
            self.debounce,
        ));
        Ok(WatchHandle::Filesystem(FsWatch {
            _watcher: watcher,
            debounce,
        }))
    }

    async fn remove_watch(&self, repo: &RepoRef, _handle: &WatchHandle) -> Result<()> {
        // The watcher stops when the handle is dropped.
        debug!(repo = %repo, "releasing ref watch");
        Ok(())
    }
}

fn git_dir(repo: &Path) -> PathBuf {
    let dot_git = repo.join(".git");
    if dot_git.is_dir() {
        dot_git
    } else {
        repo.to_path_buf()
    }
}

fn is_ref_path(path: &Path, refs_dir: &Path) -> bool {
    if path.extension().is_some_and(|ext| ext == "lock") {
        return false;
    }
    if path.starts_with(refs_dir) {
        return true;
    }
    path.file_name()
        .is_some_and(|name| name == "packed-refs" || name == "HEAD")
}

async fn debounce_signals(
    mut raw: mpsc::UnboundedReceiver<()>,
    key: String,
    signal: ChangeSender,
    window: Duration,
) {
    while raw.recv().await.is_some() {
        loop {
            match tokio::time::timeout(window, raw.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        debug!("Refs changed for {}", key);
        if signal.send(key.clone()).is_err() {
            warn!("Change receiver dropped; stopping ref watch for {}", key);
            return;
        }
    }
}

/// Parse `git show-ref` output into `name -> sha`. Peeled `^{}` lines win.
fn parse_show_ref(output: &str, prefix: &str) -> BTreeMap<String, String> {
    let mut refs = BTreeMap::new();
    let mut peeled = Vec::new();
    for line in output.lines() {
        let Some((sha, name)) = line.trim().split_once(' ') else {
            continue;
        };
        let Some(name) = name.strip_prefix(prefix) else {
            continue;
        };
        match name.strip_suffix("^{}") {
            Some(base) => peeled.push((base.to_string(), sha.to_string())),
            None => {
                refs.insert(name.to_string(), sha.to_string());
            }
        }
    }
    refs.extend(peeled);
    refs
}

/// Parse `git log --pretty=raw -z` output.
fn parse_raw_log(output: &str) -> Vec<CommitNode> {
    output
        .split('\0')
        .filter_map(|record| parse_raw_commit(record.trim_start_matches('\n')))
        .collect()
}

fn parse_raw_commit(record: &str) -> Option<CommitNode> {
    let mut lines = record.lines();
    let sha = lines
        .next()?
        .strip_prefix("commit ")?
        .split_whitespace()
        .next()?
        .to_string();

    let mut node = CommitNode {
        sha,
        parents: Vec::new(),
        author: String::new(),
        email: String::new(),
        date: None,
        message: String::new(),
    };

    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        if let Some(parent) = line.strip_prefix("parent ") {
            node.parents.push(parent.trim().to_string());
        } else if let Some(author) = line.strip_prefix("author ") {
            if let Some((name, email, date)) = parse_signature(author) {
                node.author = name;
                node.email = email;
                node.date = date;
            }
        }
    }

    let message: Vec<&str> = lines
        .map(|l| l.strip_prefix("    ").unwrap_or(l))
        .collect();
    node.message = message.join("\n").trim_end().to_string();
    Some(node)
}

/// `Name <email> 1700000000 +0100`
fn parse_signature(raw: &str) -> Option<(String, String, Option<DateTime<Utc>>)> {
    let open = raw.find('<')?;
    let close = open + raw[open..].find('>')?;
    let name = raw[..open].trim().to_string();
    let email = raw[open + 1..close].to_string();
    let date = raw[close + 1..]
        .split_whitespace()
        .next()
        .and_then(|epoch| epoch.parse::<i64>().ok())
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
    Some((name, email, date))
}
