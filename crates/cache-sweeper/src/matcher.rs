use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::entry::CacheEntry;

/// Which paths of a host a purge selects.
#[derive(Clone)]
pub enum Matcher {
    Any,
    Exact(String),
    /// Regex search anywhere in the path.
    Pattern(Regex),
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
    Set(HashSet<String>),
}

impl Matcher {
    pub fn custom(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn set<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(paths.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => path == expected,
            Self::Pattern(re) => re.is_match(path),
            Self::Custom(f) => f(path),
            Self::Set(paths) => paths.contains(path),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Exact(path) => f.debug_tuple("Exact").field(path).finish(),
            Self::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::Set(paths) => f.debug_tuple("Set").field(paths).finish(),
        }
    }
}

/// A hostname plus the paths to select under it.
#[derive(Debug, Clone)]
pub struct Criterion {
    pub hostname: String,
    pub matcher: Matcher,
}

impl Criterion {
    pub fn new(hostname: impl Into<String>, matcher: Matcher) -> Self {
        Self {
            hostname: hostname.into(),
            matcher,
        }
    }

    pub fn matches(&self, entry: &CacheEntry) -> bool {
        entry.hostname == self.hostname && self.matcher.matches(&entry.path)
    }
}
