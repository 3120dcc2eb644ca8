//! Storage encoding for XML payloads and rendered documents.
//!
//! Everything persisted goes through [`pack`] (gzip then base64). Older rows
//! hold raw text or uncompressed base64, so [`unpack`] sniffs the gzip magic
//! bytes instead of trusting the column.

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("gzip stream error: {0}")]
    Gzip(#[from] std::io::Error),
}

/// Compresses and base64-encodes a payload.
pub fn pack(data: impl AsRef<[u8]>) -> Result<String, ArtifactError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data.as_ref())?;
    Ok(BASE64.encode(encoder.finish()?))
}

/// Reverses [`pack`], tolerating legacy encodings.
///
/// - base64 of gzip: decompressed bytes
/// - base64 of anything else: decoded bytes
/// - not base64: the raw bytes of the stored value
pub fn unpack(stored: &str) -> Result<Vec<u8>, ArtifactError> {
    let trimmed = stored.trim();
    let Ok(decoded) = BASE64.decode(trimmed) else {
        return Ok(stored.as_bytes().to_vec());
    };

    if !decoded.starts_with(&GZIP_MAGIC) {
        return Ok(decoded);
    }

    let mut decoder = GzDecoder::new(decoded.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// [`unpack`] for text payloads such as XML.
pub fn unpack_text(stored: &str) -> Result<String, ArtifactError> {
    Ok(String::from_utf8_lossy(&unpack(stored)?).into_owned())
}

/// Whether the bytes start a gzip stream.
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_produces_gzip_base64() {
        let packed = pack("<NFSe/>").unwrap();
        let raw = BASE64.decode(&packed).unwrap();
        assert!(is_gzip(&raw));
        assert_eq!(unpack_text(&packed).unwrap(), "<NFSe/>");
    }

    #[test]
    fn test_raw_xml_row_is_tolerated() {
        let legacy = r#"<?xml version="1.0"?><DPS versao="1.00"></DPS>"#;
        assert_eq!(unpack_text(legacy).unwrap(), legacy);
    }

    #[test]
    fn test_uncompressed_base64_row_is_decoded() {
        let pdf = b"%PDF-1.4 fake";
        let stored = BASE64.encode(pdf);
        assert_eq!(unpack(&stored).unwrap(), pdf);
    }

    #[test]
    fn test_surrounding_whitespace_ignored() {
        let packed = format!("{}\n", pack("abc").unwrap());
        assert_eq!(unpack_text(&packed).unwrap(), "abc");
    }
}
