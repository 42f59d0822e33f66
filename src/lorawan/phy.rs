//! # PHYPayload Parser
//!
//! Decodes raw LoRaWAN PHYPayload bytes into the typed fields the analyzer
//! cares about: message type, DevAddr, frame counter, FPort, and the EUIs of
//! a Join Request. All multi-byte MAC fields are little-endian on the wire;
//! identifiers are rendered as uppercase big-endian hex strings.
//!
//! Parsing is nom-based with explicit length guards; a buffer shorter than
//! its message type requires fails with [`PhyError::TooShort`] and the
//! caller drops the event.

use nom::bytes::complete::take;
use nom::number::complete::{le_u16, u8 as any_u8};
use nom::IResult;
use thiserror::Error;

use crate::util::hex::encode_hex_upper;

/// Errors from PHYPayload parsing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhyError {
    #[error("PHYPayload too short for {mtype:?}: {len} bytes")]
    TooShort { mtype: MType, len: usize },

    #[error("Empty PHYPayload")]
    Empty,
}

/// LoRaWAN message type, from the top 3 bits of the MHDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    fn from_mhdr(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// Uplink or downlink data frame.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }
}

/// Typed fields extracted from a PHYPayload.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyFrame {
    pub mtype: MType,
    /// Uppercase hex DevAddr, data frames only.
    pub dev_addr: Option<String>,
    pub f_cnt: Option<u16>,
    pub f_port: Option<u8>,
    /// Uppercase hex JoinEUI, join requests only.
    pub join_eui: Option<String>,
    pub dev_eui: Option<String>,
    pub dev_nonce: Option<u16>,
    /// true/false for confirmed/unconfirmed data frames, None otherwise.
    pub confirmed: Option<bool>,
}

impl PhyFrame {
    fn bare(mtype: MType) -> Self {
        PhyFrame {
            mtype,
            dev_addr: None,
            f_cnt: None,
            f_port: None,
            join_eui: None,
            dev_eui: None,
            dev_nonce: None,
            confirmed: None,
        }
    }
}

// MHDR + DevAddr + FCtrl + FCnt + MIC
const MIN_DATA_LEN: usize = 12;
// MHDR + JoinEUI + DevEUI + DevNonce + MIC
const JOIN_REQUEST_LEN: usize = 23;

/// Render a little-endian EUI or DevAddr field as uppercase big-endian hex.
fn render_le_id(bytes: &[u8]) -> String {
    let mut be: Vec<u8> = bytes.to_vec();
    be.reverse();
    encode_hex_upper(&be)
}

fn parse_data_frame(input: &[u8]) -> IResult<&[u8], PhyFrame> {
    let full_len = input.len();
    let (input, mhdr) = any_u8(input)?;
    let mtype = MType::from_mhdr(mhdr);
    let (input, dev_addr) = take(4usize)(input)?;
    let (input, fctrl) = any_u8(input)?;
    let (input, f_cnt) = le_u16(input)?;
    let fopts_len = (fctrl & 0x0F) as usize;
    let (input, _fopts) = take(fopts_len)(input)?;

    // FPort is present only when something follows FOpts before the MIC.
    let consumed = 1 + 4 + 1 + 2 + fopts_len;
    let f_port = if full_len > consumed + 4 {
        Some(input[0])
    } else {
        None
    };

    let confirmed = match mtype {
        MType::ConfirmedDataUp | MType::ConfirmedDataDown => Some(true),
        _ => Some(false),
    };

    Ok((
        input,
        PhyFrame {
            mtype,
            dev_addr: Some(render_le_id(dev_addr)),
            f_cnt: Some(f_cnt),
            f_port,
            join_eui: None,
            dev_eui: None,
            dev_nonce: None,
            confirmed,
        },
    ))
}

fn parse_join_request(input: &[u8]) -> IResult<&[u8], PhyFrame> {
    let (input, _mhdr) = any_u8(input)?;
    let (input, join_eui) = take(8usize)(input)?;
    let (input, dev_eui) = take(8usize)(input)?;
    let (input, dev_nonce) = le_u16(input)?;

    Ok((
        input,
        PhyFrame {
            mtype: MType::JoinRequest,
            dev_addr: None,
            f_cnt: None,
            f_port: None,
            join_eui: Some(render_le_id(join_eui)),
            dev_eui: Some(render_le_id(dev_eui)),
            dev_nonce: Some(dev_nonce),
            confirmed: None,
        },
    ))
}

/// Decode a raw PHYPayload into its typed fields.
///
/// Join Accept, Rejoin and Proprietary frames carry no fields a passive
/// observer can read without keys, so they decode to a bare frame with just
/// the message type.
pub fn parse_phy_payload(data: &[u8]) -> Result<PhyFrame, PhyError> {
    if data.is_empty() {
        return Err(PhyError::Empty);
    }
    let mtype = MType::from_mhdr(data[0]);

    match mtype {
        MType::JoinRequest => {
            if data.len() < JOIN_REQUEST_LEN {
                return Err(PhyError::TooShort {
                    mtype,
                    len: data.len(),
                });
            }
            parse_join_request(data)
                .map(|(_, frame)| frame)
                .map_err(|_| PhyError::TooShort {
                    mtype,
                    len: data.len(),
                })
        }
        m if m.is_data() => {
            if data.len() < MIN_DATA_LEN {
                return Err(PhyError::TooShort {
                    mtype,
                    len: data.len(),
                });
            }
            // FOpts can push the header past the buffer on a lying FCtrl.
            parse_data_frame(data)
                .map(|(_, frame)| frame)
                .map_err(|_| PhyError::TooShort {
                    mtype,
                    len: data.len(),
                })
        }
        other => Ok(PhyFrame::bare(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfirmed_data_up() {
        // MHDR 0x40, DevAddr AB1A0126 (LE of 26011AAB), FCtrl 0, FCnt 1234,
        // FPort 1, 2 payload bytes, 4 MIC bytes.
        let mut frame = vec![0x40, 0xAB, 0x1A, 0x01, 0x26, 0x00, 0xD2, 0x04, 0x01];
        frame.extend_from_slice(&[0xDE, 0xAD, 0x00, 0x00, 0x00, 0x00]);

        let phy = parse_phy_payload(&frame).unwrap();
        assert_eq!(phy.mtype, MType::UnconfirmedDataUp);
        assert_eq!(phy.dev_addr.as_deref(), Some("26011AAB"));
        assert_eq!(phy.f_cnt, Some(1234));
        assert_eq!(phy.f_port, Some(1));
        assert_eq!(phy.confirmed, Some(false));
    }

    #[test]
    fn test_confirmed_flag() {
        // Confirmed data up, no FPort (header + MIC only)
        let frame = vec![
            0x80, 0xAB, 0x1A, 0x01, 0x26, 0x00, 0x05, 0x00, 0x01, 0x02, 0x03, 0x04,
        ];
        let phy = parse_phy_payload(&frame).unwrap();
        assert_eq!(phy.mtype, MType::ConfirmedDataUp);
        assert_eq!(phy.confirmed, Some(true));
        assert_eq!(phy.f_port, None);
    }

    #[test]
    fn test_join_request() {
        // JoinEUI 70B3D57ED0000001 and DevEUI 0004A30B001B8C12, both LE on
        // the wire.
        let mut frame = vec![0x00];
        frame.extend_from_slice(&[0x01, 0x00, 0x00, 0xD0, 0x7E, 0xD5, 0xB3, 0x70]);
        frame.extend_from_slice(&[0x12, 0x8C, 0x1B, 0x00, 0x0B, 0xA3, 0x04, 0x00]);
        frame.extend_from_slice(&[0x34, 0x12]); // DevNonce
        frame.extend_from_slice(&[0, 0, 0, 0]); // MIC

        let phy = parse_phy_payload(&frame).unwrap();
        assert_eq!(phy.mtype, MType::JoinRequest);
        assert_eq!(phy.join_eui.as_deref(), Some("70B3D57ED0000001"));
        assert_eq!(phy.dev_eui.as_deref(), Some("0004A30B001B8C12"));
        assert_eq!(phy.dev_nonce, Some(0x1234));
        assert_eq!(phy.dev_addr, None);
        assert_eq!(phy.confirmed, None);
    }

    #[test]
    fn test_short_buffers_fail() {
        assert_eq!(parse_phy_payload(&[]).unwrap_err(), PhyError::Empty);
        assert!(matches!(
            parse_phy_payload(&[0x40, 0x01, 0x02]).unwrap_err(),
            PhyError::TooShort { .. }
        ));
        // 22-byte join request is one short
        let short_join = vec![0x00; 22];
        assert!(matches!(
            parse_phy_payload(&short_join).unwrap_err(),
            PhyError::TooShort { .. }
        ));
    }

    #[test]
    fn test_fopts_shift_fport() {
        // FCtrl low nibble = 2 -> 2 FOpts bytes before FPort
        let frame = vec![
            0x40, 0xAB, 0x1A, 0x01, 0x26, 0x02, 0x01, 0x00, 0xAA, 0xBB, 0x07, 0xFF, 0x01, 0x02,
            0x03, 0x04,
        ];
        let phy = parse_phy_payload(&frame).unwrap();
        assert_eq!(phy.f_port, Some(0x07));
    }

    #[test]
    fn test_opaque_types_pass_through() {
        let phy = parse_phy_payload(&[0x20]).unwrap();
        assert_eq!(phy.mtype, MType::JoinAccept);
        let phy = parse_phy_payload(&[0xE0]).unwrap();
        assert_eq!(phy.mtype, MType::Proprietary);
    }
}
