//! Push webhook authentication and triage.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;

use crate::error::{GitSourceError, Result};
use crate::types::normalize_path;

type HmacSha256 = Hmac<Sha256>;

/// Pushes with at least this many commits may have a truncated file list,
/// so they always count as impactful.
pub const TRUNCATED_COMMIT_THRESHOLD: usize = 20;

/// Subset of a GitHub push event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushCommit {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

impl PushCommit {
    fn files(&self) -> impl Iterator<Item = &str> {
        self.added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .map(String::as_str)
    }
}

impl PushPayload {
    pub fn parse(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Whether this push may have changed the versions of `path`.
    pub fn impacts(&self, path: &str) -> bool {
        if self.created || self.deleted {
            return true;
        }
        if self.commits.len() >= TRUNCATED_COMMIT_THRESHOLD {
            return true;
        }
        let path = normalize_path(path);
        if path.is_empty() {
            return !self.commits.is_empty();
        }
        let prefix = format!("{path}/");
        self.commits
            .iter()
            .flat_map(PushCommit::files)
            .any(|file| file == path || file.starts_with(&prefix))
    }
}

/// `sha256=<hex>` HMAC of `body`, as sent in `X-Hub-Signature-256`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GitSourceError::Webhook(format!("invalid secret: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check an `X-Hub-Signature-256` header value against `body`.
pub fn verify_signature(secret: &str, signature: &str, body: &[u8]) -> Result<()> {
    let sig_hex = signature
        .trim()
        .strip_prefix("sha256=")
        .ok_or_else(|| GitSourceError::Webhook("signature does not start with sha256=".into()))?;
    let sig_bytes = hex::decode(sig_hex)
        .map_err(|e| GitSourceError::Webhook(format!("invalid hex in signature: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GitSourceError::Webhook(format!("invalid secret: {e}")))?;
    mac.update(body);
    mac.verify_slice(&sig_bytes)
        .map_err(|_| GitSourceError::Webhook("HMAC signature mismatch".into()))
}

/// Host-stable webhook secret derived from the network interfaces' MAC
/// addresses.
pub fn derive_hook_secret() -> String {
    secret_from_interfaces(Path::new("/sys/class/net"))
}

pub(crate) fn secret_from_interfaces(net_dir: &Path) -> String {
    let mut addresses = Vec::new();
    match std::fs::read_dir(net_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let Ok(address) = std::fs::read_to_string(entry.path().join("address")) else {
                    continue;
                };
                let address = address.trim().to_ascii_lowercase();
                if address.is_empty() || address.chars().all(|c| c == '0' || c == ':') {
                    continue;
                }
                addresses.push(address);
            }
        }
        Err(e) => warn!("Failed to list {}: {}", net_dir.display(), e),
    }
    addresses.sort();
    addresses.dedup();
    if addresses.is_empty() {
        warn!("No hardware addresses found; webhook secret is not host-specific");
    }

    let mut hasher = Sha256::new();
    hasher.update(b"trove-hook-secret\n");
    hasher.update(addresses.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(files: &[&str]) -> PushPayload {
        PushPayload {
            commits: vec![PushCommit {
                modified: files.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn triage_by_path_prefix() {
        let payload = push(&["sheets/a.csv", "README.md"]);
        assert!(payload.impacts("sheets"));
        assert!(payload.impacts("/sheets/"));
        assert!(payload.impacts(""));
        assert!(!payload.impacts("docs"));
        assert!(!payload.impacts("sheet"));
    }

    #[test]
    fn ref_creation_and_deletion_always_impact() {
        let created = PushPayload {
            created: true,
            ..Default::default()
        };
        assert!(created.impacts("anything"));
        let deleted = PushPayload {
            deleted: true,
            ..Default::default()
        };
        assert!(deleted.impacts("anything"));
    }

    #[test]
    fn large_pushes_always_impact() {
        let payload = PushPayload {
            commits: vec![PushCommit::default(); TRUNCATED_COMMIT_THRESHOLD],
            ..Default::default()
        };
        assert!(payload.impacts("docs"));

        let small = PushPayload {
            commits: vec![PushCommit::default(); TRUNCATED_COMMIT_THRESHOLD - 1],
            ..Default::default()
        };
        assert!(!small.impacts("docs"));
    }

    #[test]
    fn parses_github_push_body() {
        let body = br#"{
            "ref": "refs/heads/main",
            "created": false,
            "deleted": false,
            "commits": [{"id": "abc", "added": ["docs/new.md"], "removed": [], "modified": []}],
            "repository": {"full_name": "acme/docs"}
        }"#;
        let payload = PushPayload::parse(body).unwrap();
        assert_eq!(payload.git_ref, "refs/heads/main");
        assert!(payload.impacts("docs"));
    }

    #[test]
    fn signature_roundtrip_and_mismatch() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign_payload("s3cret", body).unwrap();
        assert!(signature.starts_with("sha256="));
        verify_signature("s3cret", &signature, body).unwrap();

        assert!(verify_signature("other", &signature, body).is_err());
        assert!(verify_signature("s3cret", &signature, b"tampered").is_err());
        assert!(verify_signature("s3cret", "sha1=abcd", body).is_err());
        assert!(verify_signature("s3cret", "sha256=zz", body).is_err());
    }

    #[test]
    fn secret_is_stable_and_ignores_loopback() {
        let dir = tempfile::tempdir().unwrap();
        for (iface, address) in [
            ("lo", "00:00:00:00:00:00"),
            ("eth0", "52:54:00:12:34:56"),
            ("wlan0", "AA:BB:CC:DD:EE:FF"),
        ] {
            std::fs::create_dir(dir.path().join(iface)).unwrap();
            std::fs::write(dir.path().join(iface).join("address"), format!("{address}\n")).unwrap();
        }

        let first = secret_from_interfaces(dir.path());
        let second = secret_from_interfaces(dir.path());
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        std::fs::remove_dir_all(dir.path().join("lo")).unwrap();
        assert_eq!(secret_from_interfaces(dir.path()), first);

        std::fs::remove_dir_all(dir.path().join("eth0")).unwrap();
        assert_ne!(secret_from_interfaces(dir.path()), first);
    }
}
