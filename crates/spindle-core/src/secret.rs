// Secrets model
//
// Secrets are keyed by (repo, key) where repo is "<did>/<name>". The locked
// view never carries the plaintext value; only the execution engine consumes
// unlocked secrets.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

fn key_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap())
}

/// Is `key` a valid secret key identifier?
pub fn is_valid_key_ident(key: &str) -> bool {
    key_ident_re().is_match(key)
}

/// Short sha256 fingerprint of a secret value, safe to show in listings
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..4])
}

/// "<did>/<repo-name>" with traversal-safe construction.
///
/// The string form is used both as a database key and as a path component
/// under remote KV mounts, so every segment is checked against traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DidSlashRepo(String);

impl DidSlashRepo {
    pub fn new(did: &str, repo: &str) -> Result<Self, String> {
        Self::try_from(format!("{did}/{repo}"))
    }

    pub fn did(&self) -> &str {
        self.0.split_once('/').map(|(did, _)| did).unwrap_or("")
    }

    pub fn repo_name(&self) -> &str {
        self.0.split_once('/').map(|(_, name)| name).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DidSlashRepo {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let Some((did, name)) = value.split_once('/') else {
            return Err(format!("expected <did>/<repo>, got {value:?}"));
        };
        if !did.starts_with("did:") || did.len() <= "did:".len() {
            return Err(format!("invalid did {did:?}"));
        }
        for segment in [did, name] {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('/')
                || segment.contains('\\')
                || segment.chars().any(|c| c.is_control())
            {
                return Err(format!("unsafe path segment {segment:?}"));
            }
        }
        Ok(DidSlashRepo(value))
    }
}

impl From<DidSlashRepo> for String {
    fn from(value: DidSlashRepo) -> Self {
        value.0
    }
}

impl fmt::Display for DidSlashRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A secret with its plaintext value (the unlocked view)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub repo: DidSlashRepo,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    /// DID of the actor that created the secret
    pub created_by: String,
}

/// The locked view: everything but the value, plus a drift fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedSecret {
    pub repo: DidSlashRepo,
    pub key: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl From<&Secret> for LockedSecret {
    fn from(secret: &Secret) -> Self {
        LockedSecret {
            repo: secret.repo.clone(),
            key: secret.key.clone(),
            fingerprint: fingerprint(&secret.value),
            created_at: secret.created_at,
            created_by: secret.created_by.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ident_grammar() {
        for ok in ["API_KEY", "_private", "k8sToken", "a"] {
            assert!(is_valid_key_ident(ok), "{ok}");
        }
        for bad in ["", "9lives", "with-dash", "with space", "pfad/zu"] {
            assert!(!is_valid_key_ident(bad), "{bad}");
        }
    }

    #[test]
    fn test_did_slash_repo_accepts_plain() {
        let repo = DidSlashRepo::new("did:plc:abc123", "widget").unwrap();
        assert_eq!(repo.did(), "did:plc:abc123");
        assert_eq!(repo.repo_name(), "widget");
        assert_eq!(repo.to_string(), "did:plc:abc123/widget");
    }

    #[test]
    fn test_did_slash_repo_rejects_traversal() {
        assert!(DidSlashRepo::new("did:plc:abc", "..").is_err());
        assert!(DidSlashRepo::new("did:plc:abc", "a/b").is_err());
        assert!(DidSlashRepo::new("did:plc:abc", ".").is_err());
        assert!(DidSlashRepo::new("did:plc:abc", "").is_err());
        assert!(DidSlashRepo::try_from("did:plc:abc/x/y".to_string()).is_err());
        assert!(DidSlashRepo::try_from("notadid/x".to_string()).is_err());
    }

    #[test]
    fn test_locked_view_has_no_value() {
        let secret = Secret {
            repo: DidSlashRepo::new("did:plc:abc", "widget").unwrap(),
            key: "API_KEY".to_string(),
            value: "hunter2".to_string(),
            created_at: Utc::now(),
            created_by: "did:plc:creator".to_string(),
        };
        let locked = LockedSecret::from(&secret);
        let json = serde_json::to_value(&locked).unwrap();
        assert!(json.get("value").is_none());
        assert_eq!(locked.fingerprint, fingerprint("hunter2"));
        assert_eq!(locked.fingerprint.len(), 8);
    }
}
