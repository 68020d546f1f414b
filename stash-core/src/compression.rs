//! Deflate (zlib) helpers used for stored objects, pkt-line payloads and
//! packfiles

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{Result, StashError};

/// Upper bound for any single inflated payload (256 MB).
pub const MAX_INFLATED_SIZE: u64 = 256 * 1024 * 1024;

/// Compress `data` with zlib framing.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress zlib-framed `data`.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| StashError::MalformedObject(format!("failed to inflate payload: {}", e)))?;
    if out.len() as u64 > MAX_INFLATED_SIZE {
        return Err(StashError::MalformedObject(format!(
            "inflated payload exceeds {} bytes",
            MAX_INFLATED_SIZE
        )));
    }
    Ok(out)
}
