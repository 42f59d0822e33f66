//! Golden PHYPayload frames through the parser.

use loratrace::lorawan::{parse_phy_payload, MType, PhyError};

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

// Unconfirmed data up: DevAddr 26011AAB, FCtrl 0x80 (ADR, no FOpts),
// FCnt 0x0001, FPort 1, 4 payload bytes, MIC.
const UNCONFIRMED_UP_HEX: &str = "40AB1A01268001000101020304AABBCCDD";

// Confirmed data up, same MAC header shape.
const CONFIRMED_UP_HEX: &str = "80AB1A01268001000101020304AABBCCDD";

// Join request: JoinEUI 70B3D57ED0000001, DevEUI 0004A30B001B8C12,
// DevNonce 0x1234, MIC.
const JOIN_REQUEST_HEX: &str = "000100_00D07ED5B370128C1B000BA304003412DEADBEEF";

// Unconfirmed data down: DevAddr 26011AAB, no FPort.
const DOWNLINK_HEX: &str = "60AB1A0126000500AABBCCDD";

#[test]
fn test_unconfirmed_data_up() {
    let phy = parse_phy_payload(&hex_to_bytes(UNCONFIRMED_UP_HEX)).unwrap();
    assert_eq!(phy.mtype, MType::UnconfirmedDataUp);
    assert_eq!(phy.dev_addr.as_deref(), Some("26011AAB"));
    assert_eq!(phy.f_cnt, Some(1));
    assert_eq!(phy.f_port, Some(1));
    assert_eq!(phy.confirmed, Some(false));
    assert_eq!(phy.join_eui, None);
}

#[test]
fn test_confirmed_data_up() {
    let phy = parse_phy_payload(&hex_to_bytes(CONFIRMED_UP_HEX)).unwrap();
    assert_eq!(phy.mtype, MType::ConfirmedDataUp);
    assert_eq!(phy.confirmed, Some(true));
}

#[test]
fn test_join_request_golden() {
    let hex: String = JOIN_REQUEST_HEX.chars().filter(|c| *c != '_').collect();
    let phy = parse_phy_payload(&hex_to_bytes(&hex)).unwrap();
    assert_eq!(phy.mtype, MType::JoinRequest);
    assert_eq!(phy.join_eui.as_deref(), Some("70B3D57ED0000001"));
    assert_eq!(phy.dev_eui.as_deref(), Some("0004A30B001B8C12"));
    assert_eq!(phy.dev_nonce, Some(0x1234));
    assert_eq!(phy.dev_addr, None);
    assert_eq!(phy.confirmed, None);
}

#[test]
fn test_downlink_without_fport() {
    let phy = parse_phy_payload(&hex_to_bytes(DOWNLINK_HEX)).unwrap();
    assert_eq!(phy.mtype, MType::UnconfirmedDataDown);
    assert_eq!(phy.dev_addr.as_deref(), Some("26011AAB"));
    assert_eq!(phy.f_cnt, Some(5));
    assert_eq!(phy.f_port, None);
    assert_eq!(phy.confirmed, Some(false));
}

#[test]
fn test_truncated_frames() {
    // one byte short of a minimal data frame
    assert!(matches!(
        parse_phy_payload(&hex_to_bytes("40AB1A0126000500AABBCC")).unwrap_err(),
        PhyError::TooShort { .. }
    ));
    // join request missing its MIC
    let short = &hex_to_bytes(
        &JOIN_REQUEST_HEX
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>(),
    )[..19];
    assert!(matches!(
        parse_phy_payload(short).unwrap_err(),
        PhyError::TooShort { .. }
    ));
    assert_eq!(parse_phy_payload(&[]).unwrap_err(), PhyError::Empty);
}
