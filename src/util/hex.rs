//! # Hex Encoding/Decoding Utilities
//!
//! Helpers for the hex identifier strings that run through the whole
//! pipeline: DevAddr (4 bytes), DevEUI/JoinEUI (8 bytes) and gateway ids are
//! all rendered as uppercase hex, and prefix arithmetic needs the numeric
//! form of a DevAddr.

use thiserror::Error;

/// Errors that can occur during hex operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HexError {
    #[error("Odd number of hex characters: {0}")]
    OddLength(usize),

    #[error("Empty hex string")]
    EmptyString,

    #[error("Hex decoding error: {0}")]
    DecodeError(String),
}

/// Encode bytes to uppercase hex string.
///
/// This is the primary encoding function used throughout the pipeline:
/// DevAddr, DevEUI, JoinEUI and gateway ids are all rendered uppercase.
pub fn encode_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Decode hex string to bytes.
///
/// Accepts both uppercase and lowercase hex characters.
/// Whitespace is automatically stripped.
pub fn decode_hex(hex_str: &str) -> Result<Vec<u8>, HexError> {
    if hex_str.is_empty() {
        return Err(HexError::EmptyString);
    }

    let cleaned: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();

    if cleaned.len() % 2 != 0 {
        return Err(HexError::OddLength(cleaned.len()));
    }

    hex::decode(&cleaned).map_err(|e| HexError::DecodeError(e.to_string()))
}

/// Parse a DevAddr hex string as a big-endian 32-bit unsigned value.
///
/// Returns `None` for anything that is not exactly 4 bytes of hex. The
/// numeric form is what the operator prefix match and the `dev_addr_uint32`
/// SQL helper work on.
pub fn dev_addr_to_u32(dev_addr: &str) -> Option<u32> {
    let bytes = decode_hex(dev_addr).ok()?;
    if bytes.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
