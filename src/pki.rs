pub mod certificate;
#[cfg(any(test, feature = "test-util"))]
pub mod test_certs;

pub use certificate::{CertificateError, CertificateSummary, Credentials, extract};
