use secrecy::{ExposeSecret, SecretSlice};

/// Key material that is zeroized on drop and redacted in `Debug`.
#[derive(Debug, Clone, Default)]
pub struct SecureBytes(SecretSlice<u8>);

impl SecureBytes {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(SecretSlice::new(data.into().into()))
    }

    pub fn expose_secret(&self) -> &[u8] {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_does_not_leak() {
        let bytes = SecureBytes::new(b"super-secret".to_vec());
        assert_eq!(bytes.len(), 12);
        assert!(!format!("{bytes:?}").contains("super-secret"));
    }
}
