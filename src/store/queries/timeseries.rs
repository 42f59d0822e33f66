//! Time-bucketed reads: packet/airtime series, channel & spreading-factor
//! distributions, duty-cycle accounting.
//!
//! The hourly continuous aggregates answer 1h/1d-bucketed questions with no
//! device filter; everything else goes to raw `packets` with
//! `time_bucket()`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Row};

use super::TimeRange;
use crate::error::TraceError;
use crate::model::PacketType;
use crate::store::Store;

/// Series bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Minutes5,
    Minutes15,
    Hour,
    Day,
}

impl Bucket {
    /// Parse the API's bucket strings; unknown values fall back to hourly.
    pub fn parse(s: &str) -> Self {
        match s {
            "5m" => Bucket::Minutes5,
            "15m" => Bucket::Minutes15,
            "1d" => Bucket::Day,
            _ => Bucket::Hour,
        }
    }

    fn interval(&self) -> &'static str {
        match self {
            Bucket::Minutes5 => "5 minutes",
            Bucket::Minutes15 => "15 minutes",
            Bucket::Hour => "1 hour",
            Bucket::Day => "1 day",
        }
    }

    /// The hourly aggregate can serve 1h and 1d buckets exactly.
    fn aggregate_capable(&self) -> bool {
        matches!(self, Bucket::Hour | Bucket::Day)
    }
}

/// Optional series grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSeriesGroup {
    Operator,
    PacketType,
    Gateway,
}

impl TimeSeriesGroup {
    fn column(&self) -> &'static str {
        match self {
            TimeSeriesGroup::Operator => "operator",
            TimeSeriesGroup::PacketType => "packet_type",
            TimeSeriesGroup::Gateway => "gateway_id",
        }
    }
}

/// Parameters of a time-series read.
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesParams {
    pub gateway_id: Option<String>,
    pub operator: Option<String>,
    pub packet_type: Option<PacketType>,
    /// A device filter forces the raw-packets path.
    pub dev_addr: Option<String>,
    pub group: Option<TimeSeriesGroup>,
    /// Chart airtime instead of packet counts.
    pub airtime: bool,
}

/// One output point.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Bucketed packet-count (or airtime) series.
pub async fn time_series(
    store: &Store,
    range: TimeRange,
    bucket: Bucket,
    params: &TimeSeriesParams,
) -> Result<Vec<TimeSeriesPoint>, TraceError> {
    let use_aggregate = bucket.aggregate_capable() && params.dev_addr.is_none();
    let value_expr = match (params.airtime, use_aggregate) {
        (true, _) => "COALESCE(SUM(airtime_us), 0)::BIGINT",
        (false, true) => "SUM(packet_count)::BIGINT",
        (false, false) => "COUNT(*)::BIGINT",
    };

    let mut builder = QueryBuilder::new("SELECT time_bucket(");
    builder.push_bind(bucket.interval());
    builder.push("::interval, ");
    builder.push(if use_aggregate { "bucket" } else { "timestamp" });
    builder.push(") AS ts, ");
    builder.push(value_expr);
    builder.push(" AS value");
    if let Some(group) = params.group {
        builder.push(", ");
        builder.push(group.column());
        builder.push(" AS group_key");
    }
    builder.push(if use_aggregate {
        " FROM packets_hourly WHERE bucket BETWEEN "
    } else {
        " FROM packets WHERE timestamp BETWEEN "
    });
    builder.push_bind(range.start);
    builder.push(" AND ");
    builder.push_bind(range.end);

    if let Some(gateway_id) = &params.gateway_id {
        builder.push(" AND gateway_id = ");
        builder.push_bind(gateway_id);
    }
    if let Some(operator) = &params.operator {
        builder.push(" AND operator = ");
        builder.push_bind(operator);
    }
    if let Some(packet_type) = params.packet_type {
        builder.push(" AND packet_type = ");
        builder.push_bind(packet_type.as_str());
    }
    if let Some(dev_addr) = &params.dev_addr {
        builder.push(" AND dev_addr = ");
        builder.push_bind(dev_addr);
    }

    builder.push(" GROUP BY ts");
    if let Some(group) = params.group {
        builder.push(", ");
        builder.push(group.column());
    }
    builder.push(" ORDER BY ts");

    let rows = builder.build().fetch_all(store.pool()).await?;
    Ok(rows
        .iter()
        .map(|row| TimeSeriesPoint {
            timestamp: row.get("ts"),
            value: row.get("value"),
            group: if params.group.is_some() {
                row.get("group_key")
            } else {
                None
            },
        })
        .collect())
}

/// One cell of the channel × SF distribution.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSfRow {
    pub frequency: i64,
    pub spreading_factor: i16,
    pub packet_count: i64,
    pub airtime_us: i64,
}

/// Channel & spreading-factor distribution. The dedicated aggregate serves
/// whole-hour windows without a device filter; otherwise raw packets.
pub async fn channel_sf_distribution(
    store: &Store,
    range: TimeRange,
    gateway_id: Option<&str>,
    dev_addr: Option<&str>,
) -> Result<Vec<ChannelSfRow>, TraceError> {
    let use_aggregate = range.spans_full_hours() && dev_addr.is_none();

    let mut builder = if use_aggregate {
        let mut b = QueryBuilder::new(
            "SELECT frequency, spreading_factor, \
             SUM(packet_count)::BIGINT AS packet_count, \
             COALESCE(SUM(airtime_us), 0)::BIGINT AS airtime_us \
             FROM packets_channel_sf_hourly WHERE bucket BETWEEN ",
        );
        b.push_bind(range.start);
        b.push(" AND ");
        b.push_bind(range.end);
        b
    } else {
        let mut b = QueryBuilder::new(
            "SELECT frequency, COALESCE(spreading_factor, 0)::SMALLINT AS spreading_factor, \
             COUNT(*)::BIGINT AS packet_count, \
             COALESCE(SUM(airtime_us), 0)::BIGINT AS airtime_us \
             FROM packets WHERE timestamp BETWEEN ",
        );
        b.push_bind(range.start);
        b.push(" AND ");
        b.push_bind(range.end);
        b
    };

    if let Some(gateway_id) = gateway_id {
        builder.push(" AND gateway_id = ");
        builder.push_bind(gateway_id);
    }
    if let Some(dev_addr) = dev_addr {
        builder.push(" AND dev_addr = ");
        builder.push_bind(dev_addr);
    }
    if use_aggregate {
        builder.push(" GROUP BY frequency, spreading_factor");
    } else {
        builder.push(" GROUP BY frequency, COALESCE(spreading_factor, 0)");
    }
    builder.push(" ORDER BY frequency, spreading_factor");

    let rows = builder.build().fetch_all(store.pool()).await?;
    Ok(rows
        .iter()
        .map(|row| ChannelSfRow {
            frequency: row.get("frequency"),
            spreading_factor: row.get("spreading_factor"),
            packet_count: row.get("packet_count"),
            airtime_us: row.get("airtime_us"),
        })
        .collect())
}

/// Duty-cycle figures for a window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DutyCycle {
    /// Uplink airtime as percent of the window.
    pub rx_airtime_percent: f64,
    /// Downlink airtime as percent of the window.
    pub tx_duty_cycle_percent: f64,
}

/// Airtime percentages for one gateway, or averaged across gateways when
/// none is given (summing percentages across antennas would overstate the
/// band occupancy).
pub async fn duty_cycle(
    store: &Store,
    range: TimeRange,
    gateway_id: Option<&str>,
) -> Result<DutyCycle, TraceError> {
    let window_us = range.duration_us();
    if window_us <= 0 {
        return Ok(DutyCycle::default());
    }

    let rows = sqlx::query(
        r#"
        SELECT gateway_id,
            COALESCE(SUM(airtime_us) FILTER (WHERE packet_type IN ('data', 'join_request')), 0)::BIGINT AS rx_us,
            COALESCE(SUM(airtime_us) FILTER (WHERE packet_type = 'downlink'), 0)::BIGINT AS tx_us
        FROM packets
        WHERE timestamp BETWEEN $1 AND $2
          AND ($3::TEXT IS NULL OR gateway_id = $3)
        GROUP BY gateway_id
        "#,
    )
    .bind(range.start)
    .bind(range.end)
    .bind(gateway_id)
    .fetch_all(store.pool())
    .await?;

    if rows.is_empty() {
        return Ok(DutyCycle::default());
    }

    let percentages: Vec<(f64, f64)> = rows
        .iter()
        .map(|row| {
            let rx_us: i64 = row.get("rx_us");
            let tx_us: i64 = row.get("tx_us");
            (
                rx_us as f64 / window_us as f64 * 100.0,
                tx_us as f64 / window_us as f64 * 100.0,
            )
        })
        .collect();

    let n = percentages.len() as f64;
    Ok(DutyCycle {
        rx_airtime_percent: percentages.iter().map(|p| p.0).sum::<f64>() / n,
        tx_duty_cycle_percent: percentages.iter().map(|p| p.1).sum::<f64>() / n,
    })
}
