//! At-rest encryption for tenant certificate material.
//!
//! Values are stored as `hex(iv):hex(ciphertext)` using AES-256-CBC with a
//! fresh random IV per call. Anything that does not look like that format is
//! legacy plaintext and passes through [`CredentialVault::decrypt`] untouched.

use tracing::warn;

use crate::crypto::{self, SecureBytes, sym::AesEncryptor};

const IV_LEN: usize = 16;

/// Errors raised while building a vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault key must be 64 hex characters or 32 raw bytes, got {0} characters")]
    InvalidKey(usize),
    #[error(transparent)]
    Crypto(#[from] crypto::Error),
}

/// Symmetric encryption of stored certificates and passwords.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    key: SecureBytes,
    encryptor: AesEncryptor,
}

impl CredentialVault {
    /// Builds a vault from the configured key material.
    ///
    /// Accepts either a 64 character hex string or a raw 32 byte string.
    pub fn new(key: &str) -> Result<Self, VaultError> {
        let key = key.trim();
        let bytes = if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) {
            crypto::hex_to_bytes(key)?
        } else if key.len() == 32 {
            key.as_bytes().to_vec()
        } else {
            return Err(VaultError::InvalidKey(key.len()));
        };

        Ok(Self {
            key: SecureBytes::new(bytes),
            encryptor: AesEncryptor::new(),
        })
    }

    /// Encrypts a value into the `hex(iv):hex(ciphertext)` format.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let iv = crypto::generate_random_bytes(IV_LEN)?;
        let ciphertext = self.encryptor.encrypt(&self.key, &iv, plaintext.as_bytes())?;
        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypts a stored value.
    ///
    /// Never fails: legacy plaintext is returned as is, and a value that
    /// cannot be decrypted (wrong key, corrupted row) is returned unchanged so
    /// the caller can report it with [`is_encrypted`](Self::is_encrypted).
    pub fn decrypt(&self, value: &str) -> String {
        let Some((iv, ciphertext)) = split_encrypted(value) else {
            return value.to_string();
        };

        match self
            .encryptor
            .decrypt(&self.key, &iv, &ciphertext)
            .ok()
            .and_then(|plain| String::from_utf8(plain).ok())
        {
            Some(plain) => plain,
            None => {
                warn!("Stored credential could not be decrypted with the configured vault key");
                value.to_string()
            }
        }
    }

    /// Whether the value has the shape of vault ciphertext.
    pub fn is_encrypted(value: &str) -> bool {
        split_encrypted(value).is_some()
    }
}

fn split_encrypted(value: &str) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut parts = value.split(':');
    let (iv, ciphertext) = (parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let iv = hex::decode(iv).ok()?;
    let ciphertext = hex::decode(ciphertext).ok()?;
    (iv.len() == IV_LEN && !ciphertext.is_empty()).then_some((iv, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";

    fn vault() -> CredentialVault {
        CredentialVault::new(HEX_KEY).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let vault = vault();
        for value in ["", "1234", "senha com espaços e acentuação", "a:b:c"] {
            let encrypted = vault.encrypt(value).unwrap();
            assert!(CredentialVault::is_encrypted(&encrypted));
            assert_eq!(vault.decrypt(&encrypted), value);
        }
    }

    #[test]
    fn test_random_iv_per_call() {
        let vault = vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.split(':').next().unwrap().len(), 32);
    }

    #[test]
    fn test_legacy_plaintext_passthrough() {
        let vault = vault();
        for legacy in ["plain-password", "MIIKAgIBAzCCCc", "no:hex", "abc:def:ghi", ""] {
            assert_eq!(vault.decrypt(legacy), legacy);
        }
    }

    #[test]
    fn test_wrong_key_returns_input() {
        let encrypted = vault().encrypt("secret").unwrap();
        let other = CredentialVault::new("0123456789abcdef0123456789abcdef").unwrap();

        // Padding almost always fails; either way the plaintext never leaks
        assert_ne!(other.decrypt(&encrypted), "secret");
    }

    #[test]
    fn test_corrupted_ciphertext_returns_input() {
        let vault = vault();
        let corrupted = format!("{}:{}", "00".repeat(16), "ab".repeat(15));
        assert_eq!(vault.decrypt(&corrupted), corrupted);
    }

    #[test]
    fn test_raw_key_accepted() {
        let vault = CredentialVault::new("0123456789abcdef0123456789abcdef").unwrap();
        let encrypted = vault.encrypt("x").unwrap();
        assert_eq!(vault.decrypt(&encrypted), "x");
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(
            CredentialVault::new("short"),
            Err(VaultError::InvalidKey(5))
        ));
    }
}
