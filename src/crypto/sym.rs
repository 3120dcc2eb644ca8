use crate::crypto::SecureBytes;
use crate::crypto::errors::{CryptoResult, Error};
use openssl::symm::{Cipher, Crypter, Mode};

const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// AES-256-CBC with PKCS#7 padding.
///
/// Ciphertexts stay interchangeable with rows written by other AES-CBC
/// implementations using the same key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesEncryptor;

impl AesEncryptor {
    pub const fn new() -> Self {
        Self
    }

    pub fn encrypt(
        &self,
        key: &SecureBytes,
        iv: impl AsRef<[u8]>,
        plaintext: impl AsRef<[u8]>,
    ) -> CryptoResult<Vec<u8>> {
        run(Mode::Encrypt, key, iv.as_ref(), plaintext.as_ref())
    }

    pub fn decrypt(
        &self,
        key: &SecureBytes,
        iv: impl AsRef<[u8]>,
        ciphertext: impl AsRef<[u8]>,
    ) -> CryptoResult<Vec<u8>> {
        let ciphertext = ciphertext.as_ref();
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(Error::Invalid(format!(
                "ciphertext length {} is not a positive multiple of the block size",
                ciphertext.len()
            )));
        }
        run(Mode::Decrypt, key, iv.as_ref(), ciphertext)
    }
}

fn run(mode: Mode, key: &SecureBytes, iv: &[u8], input: &[u8]) -> CryptoResult<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(Error::Invalid(format!(
            "Wrong key size: expected {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    if iv.len() != BLOCK_LEN {
        return Err(Error::Invalid(format!(
            "IV must be {BLOCK_LEN} bytes, got {}",
            iv.len()
        )));
    }

    let mut crypter = Crypter::new(Cipher::aes_256_cbc(), mode, key.expose_secret(), Some(iv))?;
    crypter.pad(true);

    let mut output = vec![0u8; input.len() + BLOCK_LEN];
    let mut count = crypter.update(input, &mut output)?;
    count += crypter.finalize(&mut output[count..])?;
    output.truncate(count);

    Ok(output)
}
