use crate::crypto::errors::{CryptoResult, Error};
use rand::{TryRngCore, rngs::OsRng};

/// Generate cryptographically secure random bytes
pub fn generate_random_bytes(length: usize) -> CryptoResult<Vec<u8>> {
    let mut buf = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::Random(e.to_string()))?;
    Ok(buf)
}

/// Convert hex string to bytes with validation
pub fn hex_to_bytes(hex_str: &str) -> CryptoResult<Vec<u8>> {
    // Remove common prefixes and whitespace
    let cleaned = hex_str
        .trim()
        .strip_prefix("0x")
        .or_else(|| hex_str.trim().strip_prefix("0X"))
        .unwrap_or(hex_str.trim());

    Ok(hex::decode(cleaned)?)
}
