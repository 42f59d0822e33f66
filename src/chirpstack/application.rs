//! # Application Event Decoding
//!
//! The application side of the broker (`application/{app}/device/{eui}/...`)
//! is always JSON. Events carry ChirpStack's `deviceInfo` block, so packets
//! on this bus are keyed by DevEUI and arrive with device and application
//! names attached.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::TraceError;

/// Device identity block present on every application event.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub dev_eui: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub application_name: Option<String>,
}

impl DeviceInfo {
    /// Operator label for application-bus packets.
    pub fn operator(&self) -> String {
        self.application_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.application_id.clone())
    }
}

/// Decoded `event/up`.
#[derive(Debug, Clone, Default)]
pub struct AppUplink {
    pub device_info: DeviceInfo,
    pub dev_addr: Option<String>,
    pub rssi: i32,
    pub snr: f64,
    pub frequency: i64,
    pub spreading_factor: Option<i16>,
    pub bandwidth: Option<i64>,
    pub payload_size: i32,
    pub f_cnt: Option<i64>,
    pub f_port: Option<i16>,
    pub confirmed: Option<bool>,
    pub time: Option<DateTime<Utc>>,
}

/// Decoded `event/txack`.
#[derive(Debug, Clone, Default)]
pub struct AppTxAck {
    pub device_info: DeviceInfo,
    pub f_cnt: Option<i64>,
    pub time: Option<DateTime<Utc>>,
}

/// Decoded `event/ack` (confirmed-downlink acknowledgement).
#[derive(Debug, Clone, Default)]
pub struct AppAck {
    pub device_info: DeviceInfo,
    pub acknowledged: bool,
    pub f_cnt: Option<i64>,
    pub time: Option<DateTime<Utc>>,
}

/// Decoded `command/down`.
#[derive(Debug, Clone, Default)]
pub struct AppDownlink {
    pub device_info: DeviceInfo,
    pub dev_eui_from_topic: String,
    pub f_port: Option<i16>,
    pub payload_size: i32,
    pub confirmed: Option<bool>,
}

/// An application-bus event, tagged by topic kind.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Up(AppUplink),
    TxAck(AppTxAck),
    Ack(AppAck),
    Down(AppDownlink),
}

/// Event kinds carried in the topic suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppTopicKind {
    Up,
    TxAck,
    Ack,
    CommandDown,
}

/// Extract `(application_id, dev_eui, kind)` from an application topic.
/// Malformed topics yield `None` and the message is ignored.
pub fn parse_app_topic(topic: &str) -> Option<(String, String, AppTopicKind)> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() != 6 || segments[0] != "application" || segments[2] != "device" {
        return None;
    }
    let kind = match (segments[4], segments[5]) {
        ("event", "up") => AppTopicKind::Up,
        ("event", "txack") => AppTopicKind::TxAck,
        ("event", "ack") => AppTopicKind::Ack,
        ("command", "down") => AppTopicKind::CommandDown,
        _ => return None,
    };
    Some((segments[1].to_string(), segments[3].to_string(), kind))
}

fn device_info(root: &Value) -> DeviceInfo {
    serde_json::from_value(root["deviceInfo"].clone()).unwrap_or_default()
}

fn event_time(root: &Value) -> Option<DateTime<Utc>> {
    root["time"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn base64_len(value: &Value) -> i32 {
    use base64::Engine;
    value
        .as_str()
        .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
        .map(|bytes| bytes.len() as i32)
        .unwrap_or(0)
}

fn decode_up(root: &Value) -> AppUplink {
    let rx0 = &root["rxInfo"][0];
    let lora = &root["txInfo"]["modulation"]["lora"];
    AppUplink {
        device_info: device_info(root),
        dev_addr: root["devAddr"]
            .as_str()
            .map(|s| s.to_ascii_uppercase()),
        rssi: number_field(&rx0["rssi"]).unwrap_or(0.0) as i32,
        snr: number_field(&rx0["snr"]).unwrap_or(0.0),
        frequency: number_field(&root["txInfo"]["frequency"]).unwrap_or(0.0) as i64,
        spreading_factor: number_field(&lora["spreadingFactor"]).map(|v| v as i16),
        bandwidth: number_field(&lora["bandwidth"]).map(|v| v as i64),
        payload_size: base64_len(&root["data"]),
        f_cnt: number_field(&root["fCnt"]).map(|v| v as i64),
        f_port: number_field(&root["fPort"]).map(|v| v as i16),
        confirmed: root["confirmed"].as_bool(),
        time: event_time(root),
    }
}

/// Decode one application event; the topic supplies the event kind and the
/// authoritative application id / DevEUI.
pub fn decode_app_event(kind: AppTopicKind, payload: &[u8]) -> Result<AppEvent, TraceError> {
    let root: Value = serde_json::from_slice(payload)?;
    let event = match kind {
        AppTopicKind::Up => AppEvent::Up(decode_up(&root)),
        AppTopicKind::TxAck => AppEvent::TxAck(AppTxAck {
            device_info: device_info(&root),
            f_cnt: number_field(&root["fCntDown"]).or(number_field(&root["fCnt"])).map(|v| v as i64),
            time: event_time(&root),
        }),
        AppTopicKind::Ack => AppEvent::Ack(AppAck {
            device_info: device_info(&root),
            acknowledged: root["acknowledged"].as_bool().unwrap_or(false),
            f_cnt: number_field(&root["fCntDown"]).or(number_field(&root["fCnt"])).map(|v| v as i64),
            time: event_time(&root),
        }),
        AppTopicKind::CommandDown => AppEvent::Down(AppDownlink {
            device_info: device_info(&root),
            dev_eui_from_topic: root["devEui"].as_str().unwrap_or_default().to_string(),
            f_port: number_field(&root["fPort"]).map(|v| v as i16),
            payload_size: base64_len(&root["data"]),
            confirmed: root["confirmed"].as_bool(),
        }),
    };
    Ok(event)
}
