mod errors;
mod keys;
pub mod rsa;
pub mod sym;
mod utils;

pub use errors::Error;
pub use keys::SecureBytes;
pub use utils::*;

use errors::CryptoResult;
use openssl::hash::{Hasher, MessageDigest as Digest};

/// Digests of the XML signature profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    /// SHA-1, mandated by the national NFS-e signature profile
    Sha1,
}

impl HashAlg {
    pub fn hash(&self, data: impl AsRef<[u8]>) -> CryptoResult<Vec<u8>> {
        let mut hasher = Hasher::new(self.into())?;
        hasher.update(data.as_ref())?;
        Ok(hasher.finish()?.to_vec())
    }
}

impl From<&HashAlg> for Digest {
    fn from(hash_alg: &HashAlg) -> Self {
        match hash_alg {
            HashAlg::Sha1 => Digest::sha1(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        let digest = HashAlg::Sha1.hash(b"abc").unwrap();
        assert_eq!(hex::encode(digest), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
