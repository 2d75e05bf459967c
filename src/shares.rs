//! Guardian shares encrypted at rest
//!
//! Each share is sealed with AES-256-GCM under a key derived from the
//! guardian's own secret, so only that guardian can open it.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::shamir::SecretShare;

const SHARE_FORMAT_VERSION: u8 = 1;

/// Share sealing errors
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("invalid guardian secret")]
    InvalidSecret,
    #[error("unsupported share format version {0}")]
    UnsupportedVersion(u8),
}

/// Long-lived Shamir share of the federation key, encrypted for its guardian
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianShare {
    /// Format version
    pub version: u8,
    pub guardian_id: String,
    pub share_index: u16,
    /// Salt for key derivation (hex-encoded)
    pub salt: String,
    /// Nonce for AES-GCM (hex-encoded)
    pub nonce: String,
    /// Encrypted share value (hex-encoded)
    pub encrypted_share_value: String,
}

fn derive_key(guardian_secret: &str, guardian_id: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(guardian_secret.as_bytes());
    hasher.update(salt);
    hasher.update(guardian_id.as_bytes());
    hasher.update(b"guardian-share-v1");
    Zeroizing::new(hasher.finalize().into())
}

/// Encrypt a plaintext share for `guardian_id`
pub fn seal_share(
    guardian_id: &str,
    share: &SecretShare,
    guardian_secret: &str,
) -> Result<GuardianShare, ShareError> {
    let mut salt = [0u8; 16];
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key = derive_key(guardian_secret, guardian_id, &salt);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| ShareError::Encryption(e.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, share.value().as_slice())
        .map_err(|e| ShareError::Encryption(e.to_string()))?;

    Ok(GuardianShare {
        version: SHARE_FORMAT_VERSION,
        guardian_id: guardian_id.to_string(),
        share_index: share.index,
        salt: hex::encode(salt),
        nonce: hex::encode(nonce_bytes),
        encrypted_share_value: hex::encode(ciphertext),
    })
}

impl GuardianShare {
    /// Decrypt with the guardian's secret
    pub fn open(&self, guardian_secret: &str) -> Result<SecretShare, ShareError> {
        if self.version != SHARE_FORMAT_VERSION {
            return Err(ShareError::UnsupportedVersion(self.version));
        }

        let salt = hex::decode(&self.salt).map_err(|e| ShareError::Decryption(e.to_string()))?;
        let nonce_bytes =
            hex::decode(&self.nonce).map_err(|e| ShareError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(ShareError::Decryption("nonce must be 12 bytes".to_string()));
        }
        let ciphertext = hex::decode(&self.encrypted_share_value)
            .map_err(|e| ShareError::Decryption(e.to_string()))?;

        let key = derive_key(guardian_secret, &self.guardian_id, &salt);
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| ShareError::Decryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(nonce, ciphertext.as_ref())
                .map_err(|_| ShareError::InvalidSecret)?,
        );
        if plaintext.len() != 32 {
            return Err(ShareError::Decryption("share must be 32 bytes".to_string()));
        }

        let mut value = [0u8; 32];
        value.copy_from_slice(&plaintext);
        let share = SecretShare::new(self.share_index, value);
        zeroize::Zeroize::zeroize(&mut value);
        Ok(share)
    }
}

/// Write sealed shares as pretty JSON
pub fn write_shares(path: impl AsRef<Path>, shares: &[GuardianShare]) -> Result<(), ShareError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(shares)?)?;

    tracing::info!(path = %path.display(), count = shares.len(), "Saved sealed guardian shares");
    Ok(())
}

pub fn read_shares(path: impl AsRef<Path>) -> Result<Vec<GuardianShare>, ShareError> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_deterministic() {
        let key1 = derive_key("secret", "g1", b"salt");
        let key2 = derive_key("secret", "g1", b"salt");
        assert_eq!(*key1, *key2);

        let key3 = derive_key("secret", "g2", b"salt");
        assert_ne!(*key1, *key3);
    }

    #[test]
    fn test_seal_and_open() {
        let share = SecretShare::new(3, [0x11; 32]);
        let sealed = seal_share("g3", &share, "hunter2").unwrap();
        assert_eq!(sealed.share_index, 3);
        assert!(!sealed.encrypted_share_value.contains(&"11".repeat(32)));

        let opened = sealed.open("hunter2").unwrap();
        assert_eq!(opened.index, 3);
        assert_eq!(opened.value(), share.value());
    }

    #[test]
    fn test_wrong_secret_fails() {
        let share = SecretShare::new(1, [0x22; 32]);
        let sealed = seal_share("g1", &share, "correct").unwrap();
        assert!(matches!(sealed.open("wrong"), Err(ShareError::InvalidSecret)));
    }

    #[test]
    fn test_share_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.json");
        let sealed = seal_share("g1", &SecretShare::new(1, [0x33; 32]), "pw").unwrap();

        write_shares(&path, std::slice::from_ref(&sealed)).unwrap();
        let loaded = read_shares(&path).unwrap();
        assert_eq!(loaded, vec![sealed]);
    }
}
