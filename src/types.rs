//! Shared identifier types.

use crate::error::StorageError;

/// 32-byte BLAKE3 digest
pub type Hash = [u8; 32];

/// Content hash of an exposure file; the catalog identity of a frame
pub type FrameHash = Hash;

/// Deterministic session identifier (digest of the grouping key and night anchor)
pub type SessionId = Hash;

/// Render a hash as lowercase hex
pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// First 12 hex characters, for logs and tables
pub fn short_hex(hash: &Hash) -> String {
    let mut s = hex::encode(hash);
    s.truncate(12);
    s
}

/// Parse a 64-character hex string (optionally `0x` prefixed) into a hash
pub fn parse_hex(input: &str) -> Result<Hash, StorageError> {
    let bytes = hex::decode(input.trim().trim_start_matches("0x"))
        .map_err(|_| StorageError::InvalidId(input.to_string()))?;
    if bytes.len() != 32 {
        return Err(StorageError::InvalidId(format!(
            "{} (expected 64 hex characters)",
            input
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
