use crate::crypto::HashAlg;
use crate::crypto::errors::{CryptoResult, Error};
use openssl::pkey::{PKey, Private, Public};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use std::fmt;

/// Smallest modulus accepted for signing keys
const MIN_KEY_BITS: u32 = 1024;

/// RSA signing key of a tenant certificate.
pub struct RsaPrivateKey {
    key: PKey<Private>,
    bits: u32,
}

impl RsaPrivateKey {
    /// Load from PEM-encoded PKCS#1/PKCS#8.
    pub fn from_pem(pem_bytes: impl AsRef<[u8]>) -> CryptoResult<Self> {
        let key = PKey::private_key_from_pem(pem_bytes.as_ref())?;
        let rsa = key
            .rsa()
            .map_err(|_| Error::Invalid("Private key is not an RSA key".into()))?;
        let bits = rsa.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(Error::Invalid(format!("RSA key too small: {bits} bits")));
        }
        Ok(Self { key, bits })
    }
}

impl fmt::Debug for RsaPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaPrivateKey")
            .field("bits", &self.bits)
            .finish_non_exhaustive()
    }
}

/// Public half taken from an embedded X509Certificate.
#[derive(Debug, Clone)]
pub struct RsaPublicKey {
    key: PKey<Public>,
    bits: u32,
}

impl RsaPublicKey {
    pub fn from_certificate_der(der: impl AsRef<[u8]>) -> CryptoResult<Self> {
        let cert = X509::from_der(der.as_ref())?;
        let key = cert.public_key()?;
        let rsa = key
            .rsa()
            .map_err(|_| Error::Invalid("Certificate does not carry an RSA key".into()))?;
        Ok(Self {
            bits: rsa.size() * 8,
            key,
        })
    }
}

/// PKCS#1 v1.5 signature.
pub fn sign(
    private_key: &RsaPrivateKey,
    data: impl AsRef<[u8]>,
    hash_alg: HashAlg,
) -> CryptoResult<Vec<u8>> {
    let mut signer = Signer::new((&hash_alg).into(), &private_key.key)?;
    signer.update(data.as_ref())?;
    Ok(signer.sign_to_vec()?)
}

/// A signature of the wrong length is reported as invalid, not as an error.
pub fn verify(
    public_key: &RsaPublicKey,
    data: impl AsRef<[u8]>,
    signature: &[u8],
    hash_alg: HashAlg,
) -> CryptoResult<bool> {
    if signature.len() * 8 != public_key.bits as usize {
        return Ok(false);
    }

    let mut verifier = Verifier::new((&hash_alg).into(), &public_key.key)?;
    verifier.update(data.as_ref())?;
    Ok(verifier.verify(signature)?)
}
