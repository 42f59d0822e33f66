//! # Gateway Bridge Event Decoding
//!
//! Decodes the three gateway-level event types published by a
//! ChirpStack-style gateway bridge: `up` (uplink frame), `down` (downlink
//! command) and `ack` (TX acknowledgement). The bridge publishes protobuf by
//! default; a JSON fallback with identical field semantics is also accepted.
//!
//! Only the fields the analyzer consumes are extracted; everything else is
//! skipped by wire type. Field numbers follow the v4 gateway API.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::wire::{read_map_entry, WireReader};
use crate::error::TraceError;

// UplinkFrame
const UP_PHY_PAYLOAD: u32 = 1;
const UP_TX_INFO: u32 = 4;
const UP_RX_INFO: u32 = 5;

// UplinkTxInfo / DownlinkTxInfo
const TXINFO_FREQUENCY: u32 = 1;
const UP_TXINFO_MODULATION: u32 = 2;
const DOWN_TXINFO_MODULATION: u32 = 3;

// Modulation (oneof)
const MODULATION_LORA: u32 = 3;

// LoraModulationInfo
const LORA_BANDWIDTH: u32 = 1;
const LORA_SPREADING_FACTOR: u32 = 2;
const LORA_CODE_RATE_LEGACY: u32 = 3;
const LORA_CODE_RATE: u32 = 4;

// UplinkRxInfo
const RX_GATEWAY_ID: u32 = 1;
const RX_GW_TIME: u32 = 3;
const RX_RSSI: u32 = 6;
const RX_SNR: u32 = 7;
const RX_LOCATION: u32 = 12;
const RX_METADATA: u32 = 15;

// common.Location
const LOCATION_LATITUDE: u32 = 1;
const LOCATION_LONGITUDE: u32 = 2;

// google.protobuf.Timestamp
const TS_SECONDS: u32 = 1;
const TS_NANOS: u32 = 2;

// DownlinkFrame
const DOWN_ITEMS: u32 = 3;
const DOWN_ITEM_PHY_PAYLOAD: u32 = 1;
const DOWN_ITEM_TX_INFO: u32 = 3;

// DownlinkTxAck
const ACK_DOWNLINK_ID: u32 = 2;
const ACK_ITEMS: u32 = 3;
const ACK_ITEM_STATUS: u32 = 1;

/// Payload encoding selected per broker in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    #[default]
    Protobuf,
    Json,
}

/// Gateway coordinates attached to rx metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Decoded `event/up` frame.
#[derive(Debug, Clone, Default)]
pub struct GatewayUplink {
    pub phy_payload: Vec<u8>,
    pub frequency: i64,
    pub spreading_factor: Option<i16>,
    pub bandwidth: Option<i64>,
    pub code_rate: String,
    /// Gateway id from rx-info; the topic id is the fallback.
    pub gateway_id: Option<String>,
    pub rssi: i32,
    pub snr: f64,
    pub time: Option<DateTime<Utc>>,
    pub location: Option<GatewayLocation>,
    /// Helium-style `gateway_name` metadata.
    pub gateway_name: Option<String>,
    /// Set when the rx metadata names a relay.
    pub relay_id: Option<String>,
}

/// Decoded `event/down` frame.
#[derive(Debug, Clone, Default)]
pub struct GatewayDownlink {
    pub phy_payload: Vec<u8>,
    pub frequency: i64,
    pub spreading_factor: Option<i16>,
    pub bandwidth: Option<i64>,
    pub code_rate: String,
}

/// Decoded `event/ack` message.
#[derive(Debug, Clone, Default)]
pub struct GatewayTxAck {
    /// Correlation id of the acknowledged downlink.
    pub downlink_id: i64,
    /// Human-readable status name (`OK`, `CollisionPacket`, ...).
    pub status: String,
}

/// Map a TxAckStatus code to its display name.
pub fn tx_ack_status_name(code: u64) -> String {
    match code {
        0 => "Ignored".to_string(),
        1 => "OK".to_string(),
        2 => "TooLate".to_string(),
        3 => "TooEarly".to_string(),
        4 => "CollisionPacket".to_string(),
        5 => "CollisionBeacon".to_string(),
        6 => "TxFreq".to_string(),
        7 => "TxPower".to_string(),
        8 => "GpsUnlocked".to_string(),
        9 => "QueueFull".to_string(),
        10 => "InternalError".to_string(),
        11 => "DutyCycleOverflow".to_string(),
        other => format!("Status{other}"),
    }
}

/// Convert an enum-style status string (`COLLISION_PACKET`) to its display
/// name (`CollisionPacket`).
pub fn tx_ack_status_from_str(s: &str) -> String {
    if s == "OK" {
        return s.to_string();
    }
    s.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            let first = chars.next().unwrap().to_ascii_uppercase();
            let rest: String = chars.as_str().to_ascii_lowercase();
            format!("{first}{rest}")
        })
        .collect()
}

/// Map a CodeRate enum value to the `"4/x"` string form.
fn code_rate_name(code: u64) -> String {
    match code {
        2 => "4/6".to_string(),
        3 => "4/7".to_string(),
        4 => "4/8".to_string(),
        _ => "4/5".to_string(),
    }
}

#[derive(Debug, Default)]
struct LoraModulation {
    spreading_factor: Option<i16>,
    bandwidth: Option<i64>,
    code_rate: String,
}

fn decode_lora_modulation(buf: &[u8]) -> Result<LoraModulation, TraceError> {
    let mut modulation = LoraModulation::default();
    let mut reader = WireReader::new(buf);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            LORA_BANDWIDTH => modulation.bandwidth = value.as_u64().map(|v| v as i64),
            LORA_SPREADING_FACTOR => modulation.spreading_factor = value.as_u64().map(|v| v as i16),
            LORA_CODE_RATE_LEGACY => {
                if modulation.code_rate.is_empty() {
                    modulation.code_rate = value.as_str().unwrap_or_default().to_string();
                }
            }
            LORA_CODE_RATE => {
                if let Some(code) = value.as_u64() {
                    modulation.code_rate = code_rate_name(code);
                }
            }
            _ => {}
        }
    }
    Ok(modulation)
}

fn decode_modulation(buf: &[u8]) -> Result<LoraModulation, TraceError> {
    let mut reader = WireReader::new(buf);
    while let Some((field, value)) = reader.next_field()? {
        if field == MODULATION_LORA {
            if let Some(bytes) = value.as_bytes() {
                return decode_lora_modulation(bytes);
            }
        }
        // FSK / LR-FHSS modulations carry no fields we chart
    }
    Ok(LoraModulation::default())
}

fn decode_tx_info(buf: &[u8], modulation_field: u32) -> Result<(i64, LoraModulation), TraceError> {
    let mut frequency = 0i64;
    let mut modulation = LoraModulation::default();
    let mut reader = WireReader::new(buf);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            TXINFO_FREQUENCY => frequency = value.as_u64().unwrap_or(0) as i64,
            f if f == modulation_field => {
                if let Some(bytes) = value.as_bytes() {
                    modulation = decode_modulation(bytes)?;
                }
            }
            _ => {}
        }
    }
    Ok((frequency, modulation))
}

fn decode_timestamp(buf: &[u8]) -> Result<Option<DateTime<Utc>>, TraceError> {
    let mut seconds = 0i64;
    let mut nanos = 0u32;
    let mut reader = WireReader::new(buf);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            TS_SECONDS => seconds = value.as_u64().unwrap_or(0) as i64,
            TS_NANOS => nanos = value.as_u64().unwrap_or(0) as u32,
            _ => {}
        }
    }
    Ok(Utc.timestamp_opt(seconds, nanos).single())
}

fn decode_location(buf: &[u8]) -> Result<Option<GatewayLocation>, TraceError> {
    let mut latitude = None;
    let mut longitude = None;
    let mut reader = WireReader::new(buf);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            LOCATION_LATITUDE => latitude = value.as_f64(),
            LOCATION_LONGITUDE => longitude = value.as_f64(),
            _ => {}
        }
    }
    Ok(match (latitude, longitude) {
        (Some(lat), Some(lon)) if lat != 0.0 || lon != 0.0 => Some(GatewayLocation {
            latitude: lat,
            longitude: lon,
        }),
        _ => None,
    })
}

fn decode_rx_info(uplink: &mut GatewayUplink, buf: &[u8]) -> Result<(), TraceError> {
    let mut metadata: Vec<(String, String)> = Vec::new();
    let mut reader = WireReader::new(buf);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            RX_GATEWAY_ID => {
                uplink.gateway_id = value.as_str().map(|s| s.to_string());
            }
            RX_GW_TIME => {
                if let Some(bytes) = value.as_bytes() {
                    uplink.time = decode_timestamp(bytes)?;
                }
            }
            RX_RSSI => uplink.rssi = value.as_i32().unwrap_or(0),
            RX_SNR => uplink.snr = value.as_f32().unwrap_or(0.0) as f64,
            RX_LOCATION => {
                if let Some(bytes) = value.as_bytes() {
                    uplink.location = decode_location(bytes)?;
                }
            }
            RX_METADATA => {
                if let Some(bytes) = value.as_bytes() {
                    metadata.push(read_map_entry(bytes)?);
                }
            }
            _ => {}
        }
    }
    apply_rx_metadata(uplink, &metadata);
    Ok(())
}

/// Location fallback order: explicit Location field, then Helium-style
/// metadata keys. `relay_id` metadata re-homes the packet onto the relay.
fn apply_rx_metadata(uplink: &mut GatewayUplink, metadata: &[(String, String)]) {
    let mut lat = None;
    let mut lon = None;
    for (key, value) in metadata {
        match key.as_str() {
            "gateway_lat" => lat = value.parse::<f64>().ok(),
            "gateway_long" => lon = value.parse::<f64>().ok(),
            "gateway_name" => uplink.gateway_name = Some(value.clone()),
            "relay_id" => uplink.relay_id = Some(value.clone()),
            _ => {}
        }
    }
    if uplink.location.is_none() {
        if let (Some(latitude), Some(longitude)) = (lat, lon) {
            uplink.location = Some(GatewayLocation {
                latitude,
                longitude,
            });
        }
    }
}

fn decode_uplink_protobuf(payload: &[u8]) -> Result<GatewayUplink, TraceError> {
    let mut uplink = GatewayUplink::default();
    let mut reader = WireReader::new(payload);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            UP_PHY_PAYLOAD => {
                uplink.phy_payload = value.as_bytes().unwrap_or_default().to_vec();
            }
            UP_TX_INFO => {
                if let Some(bytes) = value.as_bytes() {
                    let (frequency, modulation) = decode_tx_info(bytes, UP_TXINFO_MODULATION)?;
                    uplink.frequency = frequency;
                    uplink.spreading_factor = modulation.spreading_factor;
                    uplink.bandwidth = modulation.bandwidth;
                    uplink.code_rate = modulation.code_rate;
                }
            }
            UP_RX_INFO => {
                if let Some(bytes) = value.as_bytes() {
                    decode_rx_info(&mut uplink, bytes)?;
                }
            }
            _ => {}
        }
    }
    Ok(uplink)
}

fn base64_field(value: &Value, key: &str) -> Result<Vec<u8>, TraceError> {
    use base64::Engine;
    match value.get(key).and_then(Value::as_str) {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| TraceError::EventDecode(format!("bad base64 in {key}: {e}"))),
        None => Ok(Vec::new()),
    }
}

/// Numeric field that tolerates string-encoded numbers (schema coercion).
fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_lora_modulation(tx_info: &Value) -> LoraModulation {
    let lora = &tx_info["modulation"]["lora"];
    LoraModulation {
        spreading_factor: number_field(&lora["spreadingFactor"]).map(|v| v as i16),
        bandwidth: number_field(&lora["bandwidth"]).map(|v| v as i64),
        code_rate: match lora["codeRate"].as_str() {
            Some(s) if s.starts_with("CR_") => s.trim_start_matches("CR_").replace('_', "/"),
            Some(s) => s.to_string(),
            None => String::new(),
        },
    }
}

fn decode_uplink_json(payload: &[u8]) -> Result<GatewayUplink, TraceError> {
    let root: Value = serde_json::from_slice(payload)?;
    let mut uplink = GatewayUplink {
        phy_payload: base64_field(&root, "phyPayload")?,
        ..Default::default()
    };

    let tx_info = &root["txInfo"];
    uplink.frequency = number_field(&tx_info["frequency"]).unwrap_or(0.0) as i64;
    let modulation = json_lora_modulation(tx_info);
    uplink.spreading_factor = modulation.spreading_factor;
    uplink.bandwidth = modulation.bandwidth;
    uplink.code_rate = modulation.code_rate;

    let rx_info = &root["rxInfo"];
    uplink.gateway_id = rx_info["gatewayId"].as_str().map(|s| s.to_string());
    uplink.rssi = number_field(&rx_info["rssi"]).unwrap_or(0.0) as i32;
    uplink.snr = number_field(&rx_info["snr"]).unwrap_or(0.0);
    if let Some(time) = rx_info["gwTime"].as_str().or(rx_info["time"].as_str()) {
        uplink.time = DateTime::parse_from_rfc3339(time)
            .ok()
            .map(|t| t.with_timezone(&Utc));
    }
    let location = &rx_info["location"];
    if let (Some(lat), Some(lon)) = (
        number_field(&location["latitude"]),
        number_field(&location["longitude"]),
    ) {
        if lat != 0.0 || lon != 0.0 {
            uplink.location = Some(GatewayLocation {
                latitude: lat,
                longitude: lon,
            });
        }
    }
    if let Some(metadata) = rx_info["metadata"].as_object() {
        let pairs: Vec<(String, String)> = metadata
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        apply_rx_metadata(&mut uplink, &pairs);
    }
    Ok(uplink)
}

/// Decode an `event/up` payload in the configured format.
pub fn decode_uplink(payload: &[u8], format: PayloadFormat) -> Result<GatewayUplink, TraceError> {
    match format {
        PayloadFormat::Protobuf => decode_uplink_protobuf(payload),
        PayloadFormat::Json => decode_uplink_json(payload),
    }
}

fn decode_downlink_protobuf(payload: &[u8]) -> Result<GatewayDownlink, TraceError> {
    let mut downlink = GatewayDownlink::default();
    let mut reader = WireReader::new(payload);
    while let Some((field, value)) = reader.next_field()? {
        if field == DOWN_ITEMS {
            if let Some(item) = value.as_bytes() {
                // first item wins; the bridge transmits one
                if !downlink.phy_payload.is_empty() {
                    continue;
                }
                let mut item_reader = WireReader::new(item);
                while let Some((item_field, item_value)) = item_reader.next_field()? {
                    match item_field {
                        DOWN_ITEM_PHY_PAYLOAD => {
                            downlink.phy_payload =
                                item_value.as_bytes().unwrap_or_default().to_vec();
                        }
                        DOWN_ITEM_TX_INFO => {
                            if let Some(bytes) = item_value.as_bytes() {
                                let (frequency, modulation) =
                                    decode_tx_info(bytes, DOWN_TXINFO_MODULATION)?;
                                downlink.frequency = frequency;
                                downlink.spreading_factor = modulation.spreading_factor;
                                downlink.bandwidth = modulation.bandwidth;
                                downlink.code_rate = modulation.code_rate;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    Ok(downlink)
}

fn decode_downlink_json(payload: &[u8]) -> Result<GatewayDownlink, TraceError> {
    let root: Value = serde_json::from_slice(payload)?;
    let empty = Vec::new();
    let items = root["items"].as_array().unwrap_or(&empty);
    let Some(item) = items.first() else {
        return Ok(GatewayDownlink::default());
    };
    let tx_info = &item["txInfo"];
    let modulation = json_lora_modulation(tx_info);
    Ok(GatewayDownlink {
        phy_payload: base64_field(item, "phyPayload")?,
        frequency: number_field(&tx_info["frequency"]).unwrap_or(0.0) as i64,
        spreading_factor: modulation.spreading_factor,
        bandwidth: modulation.bandwidth,
        code_rate: modulation.code_rate,
    })
}

/// Decode an `event/down` payload in the configured format.
pub fn decode_downlink(
    payload: &[u8],
    format: PayloadFormat,
) -> Result<GatewayDownlink, TraceError> {
    match format {
        PayloadFormat::Protobuf => decode_downlink_protobuf(payload),
        PayloadFormat::Json => decode_downlink_json(payload),
    }
}

fn decode_tx_ack_protobuf(payload: &[u8]) -> Result<GatewayTxAck, TraceError> {
    let mut ack = GatewayTxAck::default();
    let mut reader = WireReader::new(payload);
    while let Some((field, value)) = reader.next_field()? {
        match field {
            ACK_DOWNLINK_ID => ack.downlink_id = value.as_u64().unwrap_or(0) as i64,
            ACK_ITEMS => {
                if let Some(item) = value.as_bytes() {
                    if !ack.status.is_empty() {
                        continue;
                    }
                    let mut item_reader = WireReader::new(item);
                    while let Some((item_field, item_value)) = item_reader.next_field()? {
                        if item_field == ACK_ITEM_STATUS {
                            ack.status = tx_ack_status_name(item_value.as_u64().unwrap_or(0));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    if ack.status.is_empty() {
        ack.status = tx_ack_status_name(0);
    }
    Ok(ack)
}

fn decode_tx_ack_json(payload: &[u8]) -> Result<GatewayTxAck, TraceError> {
    let root: Value = serde_json::from_slice(payload)?;
    let status = root["items"]
        .as_array()
        .and_then(|items| items.first())
        .and_then(|item| item["status"].as_str())
        .map(tx_ack_status_from_str)
        .unwrap_or_else(|| tx_ack_status_name(0));
    Ok(GatewayTxAck {
        downlink_id: number_field(&root["downlinkId"]).unwrap_or(0.0) as i64,
        status,
    })
}

/// Decode an `event/ack` payload in the configured format.
pub fn decode_tx_ack(payload: &[u8], format: PayloadFormat) -> Result<GatewayTxAck, TraceError> {
    match format {
        PayloadFormat::Protobuf => decode_tx_ack_protobuf(payload),
        PayloadFormat::Json => decode_tx_ack_json(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(tx_ack_status_name(1), "OK");
        assert_eq!(tx_ack_status_name(4), "CollisionPacket");
        assert_eq!(tx_ack_status_name(11), "DutyCycleOverflow");
        assert_eq!(tx_ack_status_name(99), "Status99");
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(tx_ack_status_from_str("OK"), "OK");
        assert_eq!(tx_ack_status_from_str("COLLISION_PACKET"), "CollisionPacket");
        assert_eq!(
            tx_ack_status_from_str("DUTY_CYCLE_OVERFLOW"),
            "DutyCycleOverflow"
        );
    }

    #[test]
    fn test_uplink_json_decode() {
        let payload = serde_json::json!({
            "phyPayload": "QKsaASYAAQAB",
            "txInfo": {
                "frequency": 868_100_000u64,
                "modulation": {"lora": {
                    "bandwidth": 125_000,
                    "spreadingFactor": 7,
                    "codeRate": "CR_4_5"
                }}
            },
            "rxInfo": {
                "gatewayId": "aa555a0000000000",
                "rssi": -97,
                "snr": 9.5,
                "location": {"latitude": 52.37, "longitude": 4.89},
                "metadata": {"gateway_name": "rooftop"}
            }
        });
        let uplink =
            decode_uplink(payload.to_string().as_bytes(), PayloadFormat::Json).unwrap();
        assert_eq!(uplink.frequency, 868_100_000);
        assert_eq!(uplink.spreading_factor, Some(7));
        assert_eq!(uplink.bandwidth, Some(125_000));
        assert_eq!(uplink.code_rate, "4/5");
        assert_eq!(uplink.gateway_id.as_deref(), Some("aa555a0000000000"));
        assert_eq!(uplink.rssi, -97);
        assert_eq!(uplink.snr, 9.5);
        assert_eq!(uplink.gateway_name.as_deref(), Some("rooftop"));
        assert!(uplink.location.is_some());
        assert!(!uplink.phy_payload.is_empty());
    }

    #[test]
    fn test_string_coerced_numbers() {
        let payload = serde_json::json!({
            "phyPayload": "QKsaASYAAQAB",
            "txInfo": {"frequency": "868100000", "modulation": {"lora": {
                "bandwidth": "125000", "spreadingFactor": "7"
            }}},
            "rxInfo": {"gatewayId": "aa", "rssi": "-50", "snr": "3.5"}
        });
        let uplink =
            decode_uplink(payload.to_string().as_bytes(), PayloadFormat::Json).unwrap();
        assert_eq!(uplink.frequency, 868_100_000);
        assert_eq!(uplink.rssi, -50);
        assert_eq!(uplink.spreading_factor, Some(7));
    }

    #[test]
    fn test_tx_ack_json() {
        let payload = serde_json::json!({
            "downlinkId": 42,
            "items": [{"status": "COLLISION_PACKET"}]
        });
        let ack = decode_tx_ack(payload.to_string().as_bytes(), PayloadFormat::Json).unwrap();
        assert_eq!(ack.downlink_id, 42);
        assert_eq!(ack.status, "CollisionPacket");
    }
}
