//! Reverse-proxy cache purging.
//!
//! nginx stores each cached response in a file named by the md5 of its cache
//! key. [`CacheSweeper::purge`] walks the cache directory, matches entries by
//! hostname and path, and removes them. Concurrent purges share one walk.

pub mod entry;
pub mod error;
pub mod matcher;
pub mod sweeper;

pub use entry::{CacheEntry, CacheHeader, is_cache_file_name, parse_cache_header};
pub use error::{Result, SweepError};
pub use matcher::{Criterion, Matcher};
pub use sweeper::{CacheSweeper, scan};
