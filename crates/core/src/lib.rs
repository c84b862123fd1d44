pub mod aggregate;
pub mod hash;
pub mod source;

pub use aggregate::AggregateError;
pub use hash::{content_hash, is_valid_hash, sha256_hex};
pub use source::{RepoRef, normalize_repo_name};
