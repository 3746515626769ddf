//! Gzip + base64 string helpers used for handshake payloads.

use crate::error::{CoreError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Gzip `input` and base64 encode the result. Empty input yields an empty
/// string.
pub fn gzip_deflate_string(input: &str) -> Result<String> {
    if input.is_empty() {
        return Ok(String::new());
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

/// Inverse of [`gzip_deflate_string`].
///
/// # Errors
/// [`CoreError::InvalidArgument`] if `input` is not base64 encoded gzip of
/// UTF-8 text.
pub fn gzip_inflate_string(input: &str) -> Result<String> {
    if input.is_empty() {
        return Ok(String::new());
    }

    let compressed = STANDARD
        .decode(input.trim())
        .map_err(|e| CoreError::InvalidArgument(format!("payload is not base64: {e}")))?;

    let mut out = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut out)
        .map_err(|e| CoreError::InvalidArgument(format!("payload is not gzip text: {e}")))?;
    Ok(out)
}
