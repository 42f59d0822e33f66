//! # loratrace - Passive LoRaWAN Traffic Analysis
//!
//! loratrace attaches to the MQTT broker of a ChirpStack-style LoRaWAN
//! network server, decodes every gateway-level and application-level event,
//! enriches packets with derived fields (time on air, operator attribution,
//! join-session linkage), persists them into a TimescaleDB-backed store and
//! fans live packets out to filtered dashboard subscribers.
//!
//! ## Features
//!
//! - Schema-less protobuf and JSON decoding of gateway bridge events
//! - PHYPayload parsing (data frames and join requests)
//! - Semtech time-on-air computation per packet
//! - Longest-prefix operator attribution by DevAddr NetID and JoinEUI
//! - Join → DevAddr session tracking with DevEUI backfill
//! - Batched TimescaleDB writes with hourly continuous aggregates
//! - Filtered real-time feeds with at-most-once delivery per subscriber
//!
//! ## Usage
//!
//! The binary wires everything from a TOML config:
//!
//! ```text
//! loratrace --config loratrace.toml
//! ```
//!
//! As a library, the pipeline pieces compose explicitly: an
//! [`operators::OperatorMatcher`] and [`live::Broadcaster`] are shared
//! services, MQTT readers feed a channel consumed by
//! [`pipeline::Pipeline`], and [`store::writer::Writer`] owns persistence.

pub mod chirpstack;
pub mod config;
pub mod error;
pub mod live;
pub mod logging;
pub mod lorawan;
pub mod model;
pub mod operators;
pub mod pipeline;
pub mod store;
pub mod util;

pub use config::AppConfig;
pub use error::TraceError;
pub use live::{Broadcaster, Filter, SourceMode};
pub use logging::init_logger;
pub use model::{CsPacket, Gateway, LivePacket, PacketType, ParsedPacket};
pub use operators::OperatorMatcher;
pub use pipeline::Pipeline;
pub use store::Store;
