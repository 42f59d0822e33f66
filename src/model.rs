//! # Pipeline Data Model
//!
//! The typed records flowing through the analyzer: [`ParsedPacket`] is the
//! canonical row produced by the gateway pipeline, [`CsPacket`] the
//! application-bus shadow keyed on DevEUI, and [`LivePacket`] the JSON wire
//! form delivered to live subscribers. Metadata rows ([`Gateway`],
//! [`CsDevice`]) are shared between the batched writer and the broadcaster
//! caches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a gateway-pipeline packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    Data,
    JoinRequest,
    Downlink,
    TxAck,
}

impl PacketType {
    /// Stable string form used in the database and the live feed.
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Data => "data",
            PacketType::JoinRequest => "join_request",
            PacketType::Downlink => "downlink",
            PacketType::TxAck => "tx_ack",
        }
    }

    /// Uplinks are the only packets with meaningful RSSI/SNR.
    pub fn is_uplink(&self) -> bool {
        matches!(self, PacketType::Data | PacketType::JoinRequest)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data" => Some(PacketType::Data),
            "join_request" => Some(PacketType::JoinRequest),
            "downlink" => Some(PacketType::Downlink),
            "tx_ack" => Some(PacketType::TxAck),
            _ => None,
        }
    }
}

/// The canonical record emitted by the gateway pipeline.
///
/// Field presence follows the packet type: `dev_addr` is set iff the type is
/// `data`/`downlink`, `join_eui`/`dev_eui` iff `join_request`. A `tx_ack`
/// row carries the downlink correlation id in `f_cnt`, the status name in
/// `operator` and zeroed radio metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedPacket {
    /// Wall-clock time the event was received.
    pub timestamp: DateTime<Utc>,
    /// Receiving gateway id (relay id for relayed packets).
    pub gateway_id: String,
    /// Border gateway that forwarded a relayed packet.
    pub border_gateway_id: Option<String>,
    pub packet_type: PacketType,
    /// 4-byte device address, uppercase hex.
    pub dev_addr: Option<String>,
    pub join_eui: Option<String>,
    pub dev_eui: Option<String>,
    /// Resolved operator name; `"Unknown"` when no prefix matched.
    pub operator: String,
    /// Carrier frequency in Hz.
    pub frequency: i64,
    /// Spreading factor 5..12, if LoRa modulation info was present.
    pub spreading_factor: Option<i16>,
    /// Bandwidth in Hz.
    pub bandwidth: Option<i64>,
    pub rssi: i32,
    pub snr: f64,
    /// PHYPayload size in bytes.
    pub payload_size: i32,
    /// Time on air in microseconds; 0 when SF or BW is unknown.
    pub airtime_us: i64,
    pub f_cnt: Option<i64>,
    pub f_port: Option<i16>,
    /// true/false for confirmed/unconfirmed data frames, null otherwise.
    pub confirmed: Option<bool>,
    /// Opaque token linking post-Join packets to their Join event.
    pub session_id: Option<String>,
}

/// Kind of application-bus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsEventKind {
    Up,
    TxAck,
    Ack,
    Downlink,
}

/// Application-sourced shadow of an uplink (or downlink/ack event), keyed on
/// DevEUI rather than gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsPacket {
    pub timestamp: DateTime<Utc>,
    pub kind: CsEventKind,
    pub dev_eui: String,
    pub dev_addr: Option<String>,
    pub device_name: String,
    pub application_id: String,
    pub application_name: Option<String>,
    /// Application name when known, else the application id.
    pub operator: String,
    pub frequency: i64,
    pub spreading_factor: Option<i16>,
    pub bandwidth: Option<i64>,
    pub rssi: i32,
    pub snr: f64,
    pub payload_size: i32,
    pub airtime_us: i64,
    pub f_cnt: Option<i64>,
    pub f_port: Option<i16>,
    pub confirmed: Option<bool>,
    /// TX status on tx-ack events (`OK`), `ACK`/`NACK` on confirmed-downlink
    /// acknowledgements.
    pub status: Option<String>,
}

/// One row per gateway id. Created on first sighting, mutated on every
/// upsert, never deleted (retention governs packets, not gateways).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub gateway_id: String,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub group_name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// One row per DevEUI seen on the application bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsDevice {
    pub dev_eui: String,
    pub dev_addr: Option<String>,
    pub device_name: String,
    pub application_id: String,
    pub application_name: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub packet_count: i64,
}

/// Upsert payload for gateway metadata. Fields left `None` are preserved.
#[derive(Debug, Clone, Default)]
pub struct GatewayUpsert {
    pub gateway_id: String,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub group_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Subscriber-bound JSON wire form of a packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePacket {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub gateway_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub border_gateway_id: Option<String>,
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_eui: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_eui: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub operator: String,
    /// Rendered `"SF{sf}BW{bw_khz}"`, empty when modulation is unknown.
    pub data_rate: String,
    /// Carrier frequency in MHz.
    pub frequency: f64,
    pub snr: f64,
    pub rssi: i32,
    pub payload_size: i32,
    pub airtime_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f_cnt: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f_port: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    /// Set on tx_ack rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_status: Option<String>,
    /// `"chirpstack"` marks application-bus events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Render the `SF{sf}BW{bw_khz}` data-rate label.
pub fn data_rate_label(sf: Option<i16>, bandwidth: Option<i64>) -> String {
    match (sf, bandwidth) {
        (Some(sf), Some(bw)) => format!("SF{}BW{}", sf, bw / 1000),
        _ => String::new(),
    }
}

impl LivePacket {
    /// Build the live wire form of a gateway-pipeline packet.
    pub fn from_gateway(packet: &ParsedPacket, gateway_name: Option<String>) -> Self {
        LivePacket {
            timestamp: packet.timestamp.timestamp_millis(),
            gateway_id: packet.gateway_id.clone(),
            gateway_name,
            border_gateway_id: packet.border_gateway_id.clone(),
            packet_type: packet.packet_type,
            dev_addr: packet.dev_addr.clone(),
            dev_eui: packet.dev_eui.clone(),
            join_eui: packet.join_eui.clone(),
            device_name: None,
            operator: packet.operator.clone(),
            data_rate: data_rate_label(packet.spreading_factor, packet.bandwidth),
            frequency: packet.frequency as f64 / 1_000_000.0,
            snr: packet.snr,
            rssi: packet.rssi,
            payload_size: packet.payload_size,
            airtime_ms: packet.airtime_us as f64 / 1000.0,
            f_cnt: packet.f_cnt,
            f_port: packet.f_port,
            confirmed: packet.confirmed,
            tx_status: match packet.packet_type {
                PacketType::TxAck => Some(packet.operator.clone()),
                _ => None,
            },
            source: None,
        }
    }

    /// Build the live wire form of an application-bus event.
    pub fn from_cs(packet: &CsPacket) -> Self {
        let packet_type = match packet.kind {
            CsEventKind::Up => PacketType::Data,
            CsEventKind::TxAck | CsEventKind::Ack => PacketType::TxAck,
            CsEventKind::Downlink => PacketType::Downlink,
        };
        LivePacket {
            timestamp: packet.timestamp.timestamp_millis(),
            gateway_id: String::new(),
            gateway_name: None,
            border_gateway_id: None,
            packet_type,
            dev_addr: packet.dev_addr.clone(),
            dev_eui: Some(packet.dev_eui.clone()),
            join_eui: None,
            device_name: Some(packet.device_name.clone()),
            operator: packet.operator.clone(),
            data_rate: data_rate_label(packet.spreading_factor, packet.bandwidth),
            frequency: packet.frequency as f64 / 1_000_000.0,
            snr: packet.snr,
            rssi: packet.rssi,
            payload_size: packet.payload_size,
            airtime_ms: packet.airtime_us as f64 / 1000.0,
            f_cnt: packet.f_cnt,
            f_port: packet.f_port,
            confirmed: packet.confirmed,
            tx_status: packet.status.clone(),
            source: Some("chirpstack".to_string()),
        }
    }

    /// Mirror a gateway-side downlink into the ChirpStack feed for a device
    /// known to the CS cache.
    pub fn gateway_downlink_as_cs(
        packet: &ParsedPacket,
        dev_eui: &str,
        device_name: Option<String>,
    ) -> Self {
        let mut live = Self::from_gateway(packet, None);
        live.dev_eui = Some(dev_eui.to_string());
        live.device_name = device_name;
        live.source = Some("chirpstack".to_string());
        live
    }
}
