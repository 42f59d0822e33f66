//! # Read Query Layer
//!
//! Every read the external API performs, expressed as pure functions of
//! `(&Store, parameters)`. No shared state; empty results on "no rows";
//! only connectivity errors surface to the caller.
//!
//! All SQL is parameterized. Aggregate-backed fast paths are used where the
//! hourly rollups answer the question exactly; distinct-device counts are
//! always recomputed from raw `packets` because `unique_devices` in the
//! hourly aggregate is not summable across hours, gateways or operators.

pub mod chirpstack;
pub mod devices;
pub mod gateways;
pub mod packets;
pub mod timeseries;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use chirpstack::{cs_device_list, cs_device_profile, cs_recent_packets};
pub use devices::{
    compute_intervals, compute_loss, device_intervals, device_loss, device_profile,
    device_timeline, FcntRow, IntervalStats, LossReport, LossStats,
};
pub use gateways::{gateway_list, gateway_tree, GatewayListEntry, GatewayTreeNode};
pub use packets::{join_activity, recent_packets, HideRule, RecentPacketsParams};
pub use timeseries::{
    channel_sf_distribution, duty_cycle, time_series, Bucket, ChannelSfRow, DutyCycle,
    TimeSeriesGroup, TimeSeriesParams, TimeSeriesPoint,
};

/// Inclusive time window shared by every read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeRange { start, end }
    }

    /// Trailing window ending now.
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        TimeRange {
            start: end - chrono::Duration::hours(hours),
            end,
        }
    }

    pub fn duration_us(&self) -> i64 {
        (self.end - self.start).num_microseconds().unwrap_or(0)
    }

    /// Windows of at least an hour may be served from the hourly rollups.
    pub fn spans_full_hours(&self) -> bool {
        (self.end - self.start) >= chrono::Duration::hours(1)
    }
}

/// A packet row as returned by the list queries.
#[derive(Debug, Clone, Serialize)]
pub struct PacketRow {
    pub timestamp: DateTime<Utc>,
    pub gateway_id: String,
    pub packet_type: String,
    pub dev_addr: Option<String>,
    pub dev_eui: Option<String>,
    pub join_eui: Option<String>,
    pub operator: String,
    pub frequency: i64,
    pub spreading_factor: Option<i16>,
    pub rssi: i32,
    pub snr: f64,
    pub payload_size: i32,
    pub airtime_us: i64,
    pub f_cnt: Option<i64>,
    pub f_port: Option<i16>,
    pub confirmed: Option<bool>,
}

pub(crate) fn packet_row_from(row: &sqlx::postgres::PgRow) -> PacketRow {
    use sqlx::Row;
    PacketRow {
        timestamp: row.get("timestamp"),
        gateway_id: row.get("gateway_id"),
        packet_type: row.get("packet_type"),
        dev_addr: row.get("dev_addr"),
        dev_eui: row.get("dev_eui"),
        join_eui: row.get("join_eui"),
        operator: row.get("operator"),
        frequency: row.get("frequency"),
        spreading_factor: row.get("spreading_factor"),
        rssi: row.get("rssi"),
        snr: row.get("snr"),
        payload_size: row.get("payload_size"),
        airtime_us: row.get("airtime_us"),
        f_cnt: row.get("f_cnt"),
        f_port: row.get("f_port"),
        confirmed: row.get("confirmed"),
    }
}
