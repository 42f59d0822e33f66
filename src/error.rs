//! # Analyzer Error Handling
//!
//! This module defines the TraceError enum, which represents the different
//! error types that can occur in the loratrace crate.

/// Represents the different error types that can occur in the analyzer.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Indicates an error on the MQTT transport.
    #[error("MQTT transport error: {0}")]
    Mqtt(String),

    /// Indicates a PHYPayload shorter than its message type requires.
    #[error("Malformed PHYPayload: {0}")]
    MalformedPhy(String),

    /// Indicates a protobuf wire-format decoding failure.
    #[error("Protobuf wire error: {0}")]
    Wire(#[from] crate::chirpstack::wire::WireError),

    /// Indicates a JSON event that does not match the expected shape.
    #[error("Event decode error: {0}")]
    EventDecode(String),

    /// Indicates an MQTT topic that matches no known shape.
    #[error("Unroutable topic: {0}")]
    UnknownTopic(String),

    /// Indicates an invalid hexadecimal string was provided.
    #[error("Invalid hexadecimal string")]
    InvalidHexString,

    /// Indicates a database failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Indicates a configuration file problem.
    #[error("Config error: {0}")]
    Config(String),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::EventDecode(e.to_string())
    }
}

impl From<crate::lorawan::PhyError> for TraceError {
    fn from(e: crate::lorawan::PhyError) -> Self {
        TraceError::MalformedPhy(e.to_string())
    }
}
