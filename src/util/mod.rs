//! Shared utility helpers.

pub mod hex;

pub use hex::{decode_hex, dev_addr_to_u32, encode_hex_upper, HexError};
