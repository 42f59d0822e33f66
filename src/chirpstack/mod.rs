//! ChirpStack event decoding.
//!
//! Two buses feed the analyzer: the gateway bridge (protobuf by default,
//! JSON optional) and the application server (always JSON). This module
//! turns raw MQTT payloads from both into typed events; the pipeline worker
//! does the enrichment.

pub mod application;
pub mod gateway;
pub mod wire;

pub use application::{
    decode_app_event, parse_app_topic, AppEvent, AppTopicKind, AppUplink, DeviceInfo,
};
pub use gateway::{
    decode_downlink, decode_tx_ack, decode_uplink, GatewayDownlink, GatewayLocation, GatewayTxAck,
    GatewayUplink, PayloadFormat,
};
