use sha2::{Digest, Sha256};

/// Hex SHA-256 of a single buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    content_hash([bytes])
}

/// Hex SHA-256 over one or more byte sequences, fed to the hasher in order.
///
/// Producers hash either the derived bytes themselves or the identifiers of
/// the source they were computed from (file id + revision, repo + sha, ...).
pub fn content_hash<I, B>(parts: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// A content hash is a non-empty lowercase-or-uppercase hex string.
///
/// Hashes end up as file names, so anything else (separators, dots) is refused.
pub fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty() && hash.len() <= 128 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}
