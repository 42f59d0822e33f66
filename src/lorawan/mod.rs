//! LoRaWAN frame handling.
//!
//! This module provides the PHYPayload parser and the time-on-air
//! calculator. It deals only with the MAC-layer framing visible to a
//! passive observer: message types, addressing fields and counters. No key
//! material, no MIC verification, no payload decryption.

pub mod airtime;
pub mod phy;

pub use airtime::{compute_airtime_us, time_on_air_us, AirtimeParams, CodingRate};
pub use phy::{parse_phy_payload, MType, PhyError, PhyFrame};
