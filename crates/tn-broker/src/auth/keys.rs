//! File-backed API key store
//!
//! Keys look like `ak_1a2b3c4d.<secret>`. The key file only holds the
//! SHA-256 of the full key, never the key itself:
//!
//! ```toml
//! [[keys]]
//! prefix = "ak_1a2b3c4d"
//! key_sha256 = "5e88..."
//! identity = "u1"
//! verified = true
//! admin = false
//! expires_at = 1767225600   # optional, unix seconds
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use tn_core::time::current_time_secs;
use tn_core::ClientIdentity;

use super::{AuthError, AuthOutcome, Authenticator};

/// One key as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// Public part of the key, before the dot
    pub prefix: String,
    /// Hex SHA-256 of the full key
    pub key_sha256: String,
    /// Identity the key authenticates as
    pub identity: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub admin: bool,
    /// Expiry as unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Layout of the key file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ApiKeyFile {
    #[serde(default)]
    pub keys: Vec<ApiKeyEntry>,
}

/// Hex SHA-256 digest of an API key
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Create a fresh key for `identity`.
///
/// Returns the key to hand to the agent and the entry to store.
pub fn generate_api_key(identity: &str) -> (String, ApiKeyEntry) {
    let mut rng = rand::thread_rng();
    let mut prefix_bytes = [0u8; 4];
    let mut secret = [0u8; 32];
    rng.fill_bytes(&mut prefix_bytes);
    rng.fill_bytes(&mut secret);

    let prefix = format!("ak_{}", hex::encode(prefix_bytes));
    let key = format!("{}.{}", prefix, hex::encode(secret));
    let entry = ApiKeyEntry {
        prefix,
        key_sha256: hash_api_key(&key),
        identity: identity.to_string(),
        verified: true,
        admin: false,
        expires_at: None,
    };
    (key, entry)
}

/// Authenticates agents against a set of hashed API keys
#[derive(Debug, Default)]
pub struct ApiKeyAuthenticator {
    /// Entries indexed by prefix
    keys: HashMap<String, ApiKeyEntry>,
}

impl ApiKeyAuthenticator {
    /// Create an empty store that rejects everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from entries
    pub fn from_entries(entries: impl IntoIterator<Item = ApiKeyEntry>) -> Self {
        let mut store = Self::new();
        for entry in entries {
            store.add(entry);
        }
        store
    }

    /// Load the key file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading API keys from {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let file: ApiKeyFile =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;

        let store = Self::from_entries(file.keys);
        tracing::info!("Loaded {} API keys from {:?}", store.len(), path);
        Ok(store)
    }

    /// Add or replace an entry
    pub fn add(&mut self, mut entry: ApiKeyEntry) {
        entry.key_sha256.make_ascii_lowercase();
        if self.keys.insert(entry.prefix.clone(), entry).is_some() {
            tracing::warn!("Duplicate API key prefix, keeping the last entry");
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn check(&self, credential: &str, now_secs: u64) -> Result<AuthOutcome, AuthError> {
        let (prefix, secret) = credential
            .split_once('.')
            .ok_or(AuthError::InvalidCredential)?;
        if secret.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        let entry = self.keys.get(prefix).ok_or(AuthError::InvalidCredential)?;
        if !digest_eq(&hash_api_key(credential), &entry.key_sha256) {
            return Err(AuthError::InvalidCredential);
        }
        if entry.expires_at.is_some_and(|exp| exp <= now_secs) {
            return Err(AuthError::Expired);
        }

        Ok(AuthOutcome {
            identity: ClientIdentity::new(entry.identity.clone()),
            verified: entry.verified,
            is_admin: entry.admin,
        })
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<AuthOutcome, AuthError> {
        self.check(credential, current_time_secs())
    }
}

/// Constant-time comparison of hex digests
fn digest_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_generated_key_authenticates() {
        let (key, entry) = generate_api_key("u1");
        assert!(key.starts_with("ak_"));
        assert!(key.starts_with(&entry.prefix));

        let store = ApiKeyAuthenticator::from_entries([entry]);
        let outcome = store.check(&key, 0).unwrap();
        assert_eq!(outcome.identity, ClientIdentity::new("u1"));
        assert!(outcome.verified);
        assert!(!outcome.is_admin);
    }

    #[test]
    fn test_wrong_secret_and_unknown_prefix() {
        let (key, entry) = generate_api_key("u1");
        let store = ApiKeyAuthenticator::from_entries([entry.clone()]);

        let tampered = format!("{}.{}", entry.prefix, "0".repeat(64));
        assert_eq!(store.check(&tampered, 0), Err(AuthError::InvalidCredential));
        assert_eq!(
            store.check("ak_ffffffff.secret", 0),
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(store.check("no-dot", 0), Err(AuthError::InvalidCredential));
        assert!(store.check(&key, 0).is_ok());
    }

    #[test]
    fn test_expired_key() {
        let (key, mut entry) = generate_api_key("u1");
        entry.expires_at = Some(1_000);
        let store = ApiKeyAuthenticator::from_entries([entry]);

        assert!(store.check(&key, 999).is_ok());
        assert_eq!(store.check(&key, 1_000), Err(AuthError::Expired));
    }

    #[test]
    fn test_load_key_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# issued keys").unwrap();
        writeln!(file, "[[keys]]").unwrap();
        writeln!(file, "prefix = \"ak_00000001\"").unwrap();
        writeln!(
            file,
            "key_sha256 = \"{}\"",
            hash_api_key("ak_00000001.hunter2").to_uppercase()
        )
        .unwrap();
        writeln!(file, "identity = \"u7\"").unwrap();
        writeln!(file, "admin = true").unwrap();

        let store = ApiKeyAuthenticator::load_from_file(file.path()).unwrap();
        assert_eq!(store.len(), 1);

        let outcome = store.check("ak_00000001.hunter2", 0).unwrap();
        assert_eq!(outcome.identity.as_str(), "u7");
        assert!(outcome.is_admin);
        assert!(!outcome.verified);
    }

    #[test]
    fn test_stored_digest_is_normalized_on_add() {
        let (key, mut entry) = generate_api_key("u1");
        entry.key_sha256 = entry.key_sha256.to_uppercase();
        let store = ApiKeyAuthenticator::from_entries([entry.clone()]);

        let stored = &store.keys[&entry.prefix].key_sha256;
        assert_eq!(stored, &hash_api_key(&key));
        assert!(store.check(&key, 0).is_ok());
    }

    #[test]
    fn test_digest_eq() {
        let digest = hash_api_key("ak_00000001.a");
        assert!(digest_eq(&digest, &digest.clone()));
        assert!(!digest_eq(&digest, &hash_api_key("ak_00000001.b")));
        assert!(!digest_eq(&digest, &digest[..10]));
    }
}
