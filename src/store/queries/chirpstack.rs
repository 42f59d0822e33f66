//! ChirpStack-scoped reads: the device list, recent application packets
//! and the per-DevEUI profile. Mirrors of the gateway-side reads, keyed on
//! DevEUI and fed from `cs_packets` / `cs_devices`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Row};

use super::TimeRange;
use crate::error::TraceError;
use crate::store::Store;

/// One row of the device list.
#[derive(Debug, Clone, Serialize)]
pub struct CsDeviceRow {
    pub dev_eui: String,
    pub dev_addr: Option<String>,
    pub device_name: String,
    pub application_id: String,
    pub application_name: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub packet_count: i64,
}

/// Devices seen on the application bus, most recently active first.
pub async fn cs_device_list(
    store: &Store,
    application_id: Option<&str>,
    limit: i64,
) -> Result<Vec<CsDeviceRow>, TraceError> {
    let mut builder = QueryBuilder::new(
        "SELECT dev_eui, dev_addr, device_name, application_id, application_name, \
         last_seen, packet_count FROM cs_devices",
    );
    if let Some(application_id) = application_id {
        builder.push(" WHERE application_id = ");
        builder.push_bind(application_id);
    }
    builder.push(" ORDER BY last_seen DESC LIMIT ");
    builder.push_bind(limit.clamp(1, 5000));

    let rows = builder.build().fetch_all(store.pool()).await?;
    Ok(rows
        .iter()
        .map(|row| CsDeviceRow {
            dev_eui: row.get("dev_eui"),
            dev_addr: row.get("dev_addr"),
            device_name: row.get("device_name"),
            application_id: row.get("application_id"),
            application_name: row.get("application_name"),
            last_seen: row.get("last_seen"),
            packet_count: row.get("packet_count"),
        })
        .collect())
}

/// One application-bus packet row.
#[derive(Debug, Clone, Serialize)]
pub struct CsPacketRow {
    pub timestamp: DateTime<Utc>,
    pub dev_eui: String,
    pub dev_addr: Option<String>,
    pub device_name: String,
    pub application_id: String,
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

/// Latest application uplinks, optionally scoped to one device or
/// application.
pub async fn cs_recent_packets(
    store: &Store,
    range: TimeRange,
    dev_eui: Option<&str>,
    application_id: Option<&str>,
    limit: i64,
) -> Result<Vec<CsPacketRow>, TraceError> {
    let mut builder = QueryBuilder::new(
        "SELECT timestamp, dev_eui, dev_addr, device_name, application_id, operator, \
         frequency, spreading_factor, rssi, snr, payload_size, airtime_us, f_cnt, f_port, \
         confirmed FROM cs_packets WHERE timestamp BETWEEN ",
    );
    builder.push_bind(range.start);
    builder.push(" AND ");
    builder.push_bind(range.end);
    if let Some(dev_eui) = dev_eui {
        builder.push(" AND dev_eui = ");
        builder.push_bind(dev_eui);
    }
    if let Some(application_id) = application_id {
        builder.push(" AND application_id = ");
        builder.push_bind(application_id);
    }
    builder.push(" ORDER BY timestamp DESC LIMIT ");
    builder.push_bind(limit.clamp(1, 1000));

    let rows = builder.build().fetch_all(store.pool()).await?;
    Ok(rows
        .iter()
        .map(|row| CsPacketRow {
            timestamp: row.get("timestamp"),
            dev_eui: row.get("dev_eui"),
            dev_addr: row.get("dev_addr"),
            device_name: row.get("device_name"),
            application_id: row.get("application_id"),
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
        })
        .collect())
}

/// Aggregate profile of one DevEUI over the window.
#[derive(Debug, Clone, Serialize)]
pub struct CsDeviceProfile {
    pub dev_eui: String,
    pub device_name: Option<String>,
    pub application_name: Option<String>,
    pub dev_addr: Option<String>,
    pub packet_count: i64,
    pub airtime_us: i64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub avg_rssi: Option<f64>,
    pub avg_snr: Option<f64>,
}

/// Per-DevEUI profile: traffic figures from `cs_packets`, identity from
/// `cs_devices`.
pub async fn cs_device_profile(
    store: &Store,
    dev_eui: &str,
    range: TimeRange,
) -> Result<CsDeviceProfile, TraceError> {
    let summary = sqlx::query(
        r#"
        SELECT COUNT(*)::BIGINT AS packet_count,
               COALESCE(SUM(airtime_us), 0)::BIGINT AS airtime_us,
               MIN(timestamp) AS first_seen,
               MAX(timestamp) AS last_seen,
               AVG(rssi)::FLOAT8 AS avg_rssi,
               AVG(snr)::FLOAT8 AS avg_snr
        FROM cs_packets
        WHERE dev_eui = $1 AND timestamp BETWEEN $2 AND $3
        "#,
    )
    .bind(dev_eui)
    .bind(range.start)
    .bind(range.end)
    .fetch_one(store.pool())
    .await?;

    let identity = sqlx::query(
        "SELECT device_name, application_name, dev_addr FROM cs_devices WHERE dev_eui = $1",
    )
    .bind(dev_eui)
    .fetch_optional(store.pool())
    .await?;

    Ok(CsDeviceProfile {
        dev_eui: dev_eui.to_string(),
        device_name: identity.as_ref().map(|row| row.get("device_name")),
        application_name: identity.as_ref().and_then(|row| row.get("application_name")),
        dev_addr: identity.as_ref().and_then(|row| row.get("dev_addr")),
        packet_count: summary.get("packet_count"),
        airtime_us: summary.get("airtime_us"),
        first_seen: summary.get("first_seen"),
        last_seen: summary.get("last_seen"),
        avg_rssi: summary.get("avg_rssi"),
        avg_snr: summary.get("avg_snr"),
    })
}
