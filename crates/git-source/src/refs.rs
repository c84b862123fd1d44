//! Attribution of branch and tag tips to the commits that last touched a path.

use std::collections::{HashMap, HashSet};

use crate::types::{CommitNode, RefHead, RefMap};

/// Map each relevant commit to the refs whose newest relevant ancestor it is.
///
/// `relevant` holds the commits that touched the tracked path; `recent` is
/// the wider history used to walk from ref tips back to them. Each ref walks
/// its ancestry depth first (first parent before merged parents) and stops at
/// the first relevant commit it meets. Refs that never reach one are left out.
pub fn resolve_version_refs(
    heads: &[RefHead],
    relevant: &[CommitNode],
    recent: &[CommitNode],
) -> RefMap {
    let mut parents: HashMap<&str, &[String]> = HashMap::new();
    for commit in recent.iter().chain(relevant) {
        parents
            .entry(commit.sha.as_str())
            .or_insert(commit.parents.as_slice());
    }
    let relevant: HashSet<&str> = relevant.iter().map(|c| c.sha.as_str()).collect();

    let mut map = RefMap::new();
    for head in heads {
        if let Some(sha) = first_relevant(&head.sha, &parents, &relevant) {
            map.entry(sha.to_string()).or_default().push(head.name.clone());
        }
    }
    for refs in map.values_mut() {
        refs.sort();
        refs.dedup();
    }
    map
}

fn first_relevant<'a>(
    start: &'a str,
    parents: &HashMap<&'a str, &'a [String]>,
    relevant: &HashSet<&str>,
) -> Option<&'a str> {
    let mut stack = vec![start];
    let mut visited = HashSet::new();
    while let Some(sha) = stack.pop() {
        if !visited.insert(sha) {
            continue;
        }
        if relevant.contains(sha) {
            return Some(sha);
        }
        if let Some(next) = parents.get(sha) {
            // Reversed so the first parent is popped first.
            stack.extend(next.iter().rev().map(String::as_str));
        }
    }
    None
}

/// Pick the ref that best names a version: the default branch, then any
/// branch, then any tag.
pub fn canonical_ref<'a>(refs: &'a [String], default_branch: Option<&str>) -> Option<&'a str> {
    if let Some(branch) = default_branch {
        let wanted = format!("heads/{branch}");
        if let Some(found) = refs.iter().find(|r| **r == wanted) {
            return Some(found);
        }
    }
    refs.iter()
        .find(|r| r.starts_with("heads/"))
        .or_else(|| refs.first())
        .map(String::as_str)
}
