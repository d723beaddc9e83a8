//! Stage 1 of the pipeline: full in-memory decompression.
//!
//! Grounded on the corpus's compression crates (`flate2`, `brotli`) rather
//! than hand-rolling inflate; the fail-closed-for-JS rule comes from
//! SPEC_FULL.md §4.5 and is the reason this pipeline buffers the whole body
//! instead of streaming it through a codec filter.

use std::io::Read;

use crate::error::ProxyError;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl Encoding {
    pub fn from_header(value: &str) -> Self {
        match value.trim() {
            "gzip" | "x-gzip" => Encoding::Gzip,
            "deflate" => Encoding::Deflate,
            "br" => Encoding::Brotli,
            _ => Encoding::Identity,
        }
    }
}

fn is_javascript(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    matches!(
        base,
        "application/javascript"
            | "text/javascript"
            | "application/x-javascript"
            | "application/ecmascript"
    )
}

/// Decodes `body` according to `encoding`. On failure: JS-typed bodies are a
/// fatal error (caller must 502 before writing anything downstream);
/// everything else passes the original bytes through unchanged with the
/// encoding preserved.
pub fn decompress(body: Vec<u8>, encoding: Encoding, content_type: &str) -> Result<(Vec<u8>, bool), ProxyError> {
    if encoding == Encoding::Identity {
        return Ok((body, false));
    }
    match decode(&body, encoding) {
        Ok(decoded) => Ok((decoded, true)),
        Err(e) => {
            if is_javascript(content_type) {
                Err(ProxyError::DecompressionFatal(e))
            } else {
                log::warn!("decompression failed for non-JS body, passing through compressed: {e}");
                Err(ProxyError::DecompressionSoft(e))
            }
        }
    }
}

fn decode(body: &[u8], encoding: Encoding) -> Result<Vec<u8>, String> {
    match encoding {
        Encoding::Identity => Ok(body.to_vec()),
        Encoding::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| e.to_string())?;
            Ok(out)
        }
        Encoding::Deflate => {
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| e.to_string())?;
            Ok(out)
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            brotli::Decompressor::new(body, 4096)
                .read_to_end(&mut out)
                .map_err(|e| e.to_string())?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn identity_passes_through_unchanged() {
        let (out, modified) = decompress(b"hello".to_vec(), Encoding::Identity, "text/plain").unwrap();
        assert_eq!(out, b"hello");
        assert!(!modified);
    }

    #[test]
    fn gzip_round_trips() {
        let compressed = gzip(b"<html>ok</html>");
        let (out, modified) = decompress(compressed, Encoding::Gzip, "text/html").unwrap();
        assert_eq!(out, b"<html>ok</html>");
        assert!(modified);
    }

    #[test]
    fn corrupt_javascript_is_fatal() {
        let err = decompress(b"not actually gzip".to_vec(), Encoding::Gzip, "application/javascript").unwrap_err();
        assert!(matches!(err, ProxyError::DecompressionFatal(_)));
    }

    #[test]
    fn corrupt_non_javascript_is_soft() {
        let err = decompress(b"not actually gzip".to_vec(), Encoding::Gzip, "text/css").unwrap_err();
        assert!(matches!(err, ProxyError::DecompressionSoft(_)));
    }

    #[test]
    fn encoding_from_header_recognizes_common_values() {
        assert_eq!(Encoding::from_header("gzip"), Encoding::Gzip);
        assert_eq!(Encoding::from_header("br"), Encoding::Brotli);
        assert_eq!(Encoding::from_header("deflate"), Encoding::Deflate);
        assert_eq!(Encoding::from_header("identity"), Encoding::Identity);
    }
}
