use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::{Result, SweepError};

/// Bytes read from the head of each cache file.
pub const HEADER_LEN: usize = 1024;

const KEY_MARKER: &[u8] = b"KEY: ";

/// One cached response on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hostname: String,
    /// Request URI including any query string.
    pub path: String,
    pub status: u16,
    pub size: u64,
    pub mtime: SystemTime,
    pub file: PathBuf,
}

/// What the cache file header tells us about the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    pub hostname: String,
    pub path: String,
    pub status: u16,
}

/// nginx names cache files by the 32 hex digit md5 of the key.
pub fn is_cache_file_name(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse the `KEY: <host><uri>` line and the status of the response that
/// follows it.
pub fn parse_cache_header(head: &[u8]) -> Result<CacheHeader> {
    let key_start = find_key_marker(head).ok_or(SweepError::MissingKey)? + KEY_MARKER.len();
    let key_end = head[key_start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(head.len(), |pos| key_start + pos);
    let key = String::from_utf8_lossy(&head[key_start..key_end])
        .trim_end_matches('\r')
        .to_string();
    let (hostname, path) = split_key(&key)?;

    let status = parse_status(&head[key_end.min(head.len())..]).ok_or(SweepError::MissingStatus)?;
    Ok(CacheHeader {
        hostname: hostname.to_string(),
        path: path.to_string(),
        status,
    })
}

fn find_key_marker(head: &[u8]) -> Option<usize> {
    if head.starts_with(KEY_MARKER) {
        return Some(0);
    }
    head.windows(KEY_MARKER.len() + 1)
        .position(|w| w[0] == b'\n' && &w[1..] == KEY_MARKER)
        .map(|pos| pos + 1)
}

/// Split `$proxy_host$uri$is_args$args` into host and uri.
fn split_key(key: &str) -> Result<(&str, &str)> {
    let slash = key
        .find('/')
        .ok_or_else(|| SweepError::InvalidKey(key.to_string()))?;
    // `scheme://host/...` keys come from a different proxy_cache_key.
    if slash == 0 || key.as_bytes()[slash - 1] == b':' {
        return Err(SweepError::InvalidKey(key.to_string()));
    }
    Ok((&key[..slash], &key[slash..]))
}

/// First `HTTP/x.y NNN` status after the key line.
fn parse_status(rest: &[u8]) -> Option<u16> {
    let start = rest.windows(5).position(|w| w == b"HTTP/")?;
    let line = &rest[start..];
    let line = &line[..line.iter().position(|&b| b == b'\n').unwrap_or(line.len())];
    let text = String::from_utf8_lossy(line);
    text.split_whitespace().nth(1)?.parse().ok()
}
