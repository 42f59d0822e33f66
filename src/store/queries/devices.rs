//! Per-device reads: profile, timeline, frame-counter loss, transmission
//! intervals. The gap arithmetic is pure Rust over rows fetched in
//! timestamp order, so it is testable without a database.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use super::{packet_row_from, PacketRow, TimeRange};
use crate::error::TraceError;
use crate::store::Store;

/// One uplink's counter sample, ordered by timestamp at the fetch site.
#[derive(Debug, Clone, PartialEq)]
pub struct FcntRow {
    pub session_id: Option<String>,
    pub f_cnt: i64,
    pub gateway_id: String,
}

/// Gap-derived loss figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossStats {
    pub received: i64,
    pub missed: i64,
}

impl LossStats {
    pub fn loss_percent(&self) -> f64 {
        let total = self.received + self.missed;
        if total == 0 {
            return 0.0;
        }
        self.missed as f64 / total as f64 * 100.0
    }
}

/// Overall and per-gateway loss for one device.
#[derive(Debug, Clone, Serialize, Default)]
pub struct LossReport {
    pub overall: LossStats,
    pub overall_loss_percent: f64,
    pub per_gateway: Vec<(String, LossStats)>,
}

/// Sum positive frame-counter gaps per session over rows already ordered by
/// timestamp. Counter resets (gap going negative at a session boundary or a
/// device reboot) contribute nothing.
pub fn compute_loss(rows: &[FcntRow]) -> LossStats {
    use std::collections::HashMap;
    let mut previous: HashMap<Option<&str>, i64> = HashMap::new();
    let mut stats = LossStats::default();

    for row in rows {
        stats.received += 1;
        let key = row.session_id.as_deref();
        if let Some(prev) = previous.get(&key) {
            let gap = row.f_cnt - prev - 1;
            if gap > 0 {
                stats.missed += gap;
            }
        }
        previous.insert(key, row.f_cnt);
    }
    stats
}

/// Loss for one DevAddr over the window, overall and per gateway.
pub async fn device_loss(
    store: &Store,
    dev_addr: &str,
    range: TimeRange,
) -> Result<LossReport, TraceError> {
    let rows = sqlx::query(
        r#"
        SELECT session_id, f_cnt, gateway_id
        FROM packets
        WHERE dev_addr = $1
          AND packet_type = 'data'
          AND f_cnt IS NOT NULL
          AND timestamp BETWEEN $2 AND $3
        ORDER BY timestamp
        "#,
    )
    .bind(dev_addr)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(store.pool())
    .await?;

    let samples: Vec<FcntRow> = rows
        .iter()
        .map(|row| FcntRow {
            session_id: row.get("session_id"),
            f_cnt: row.get("f_cnt"),
            gateway_id: row.get("gateway_id"),
        })
        .collect();

    let overall = compute_loss(&samples);
    let mut per_gateway: Vec<(String, LossStats)> = Vec::new();
    let mut gateway_ids: Vec<String> = samples.iter().map(|s| s.gateway_id.clone()).collect();
    gateway_ids.sort();
    gateway_ids.dedup();
    for gateway_id in gateway_ids {
        let subset: Vec<FcntRow> = samples
            .iter()
            .filter(|s| s.gateway_id == gateway_id)
            .cloned()
            .collect();
        per_gateway.push((gateway_id, compute_loss(&subset)));
    }

    Ok(LossReport {
        overall_loss_percent: overall.loss_percent(),
        overall,
        per_gateway,
    })
}

/// Transmission-interval statistics over uplink arrival times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IntervalStats {
    pub count: usize,
    pub mean_seconds: f64,
    pub median_seconds: f64,
    pub min_seconds: f64,
    pub max_seconds: f64,
}

/// Interval stats from timestamps ordered ascending. Duplicate receptions
/// of the same frame (multiple gateways) produce near-zero intervals, so
/// sub-second gaps are skipped.
pub fn compute_intervals(timestamps: &[DateTime<Utc>]) -> IntervalStats {
    let mut gaps: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
        .filter(|gap| *gap >= 1.0)
        .collect();
    if gaps.is_empty() {
        return IntervalStats::default();
    }
    gaps.sort_by(|a, b| a.partial_cmp(b).expect("no NaN gaps"));
    let count = gaps.len();
    let mean = gaps.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 1 {
        gaps[count / 2]
    } else {
        (gaps[count / 2 - 1] + gaps[count / 2]) / 2.0
    };
    IntervalStats {
        count,
        mean_seconds: mean,
        median_seconds: median,
        min_seconds: gaps[0],
        max_seconds: gaps[count - 1],
    }
}

/// Interval stats for one DevAddr over the window.
pub async fn device_intervals(
    store: &Store,
    dev_addr: &str,
    range: TimeRange,
) -> Result<IntervalStats, TraceError> {
    let rows = sqlx::query(
        r#"
        SELECT timestamp
        FROM packets
        WHERE dev_addr = $1
          AND packet_type = 'data'
          AND timestamp BETWEEN $2 AND $3
        ORDER BY timestamp
        "#,
    )
    .bind(dev_addr)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(store.pool())
    .await?;

    let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|row| row.get("timestamp")).collect();
    Ok(compute_intervals(&timestamps))
}

/// Aggregate profile of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceProfile {
    pub dev_addr: String,
    pub operator: Option<String>,
    pub dev_eui: Option<String>,
    pub packet_count: i64,
    pub airtime_us: i64,
    pub gateway_count: i64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub avg_rssi: Option<f64>,
    pub avg_snr: Option<f64>,
    pub spreading_factors: Vec<(i16, i64)>,
}

/// Profile for one DevAddr over the window; `None`-heavy but never an
/// error when the device is unseen.
pub async fn device_profile(
    store: &Store,
    dev_addr: &str,
    range: TimeRange,
) -> Result<DeviceProfile, TraceError> {
    let summary = sqlx::query(
        r#"
        SELECT
            COUNT(*)::BIGINT                  AS packet_count,
            COALESCE(SUM(airtime_us), 0)::BIGINT AS airtime_us,
            COUNT(DISTINCT gateway_id)::BIGINT AS gateway_count,
            MIN(timestamp)                    AS first_seen,
            MAX(timestamp)                    AS last_seen,
            AVG(rssi)::FLOAT8                 AS avg_rssi,
            AVG(snr)::FLOAT8                  AS avg_snr,
            MAX(operator)                     AS operator,
            MAX(dev_eui)                      AS dev_eui
        FROM packets
        WHERE dev_addr = $1
          AND packet_type = 'data'
          AND timestamp BETWEEN $2 AND $3
        "#,
    )
    .bind(dev_addr)
    .bind(range.start)
    .bind(range.end)
    .fetch_one(store.pool())
    .await?;

    let sf_rows = sqlx::query(
        r#"
        SELECT spreading_factor, COUNT(*)::BIGINT AS packet_count
        FROM packets
        WHERE dev_addr = $1
          AND packet_type = 'data'
          AND spreading_factor IS NOT NULL
          AND timestamp BETWEEN $2 AND $3
        GROUP BY spreading_factor
        ORDER BY spreading_factor
        "#,
    )
    .bind(dev_addr)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(store.pool())
    .await?;

    Ok(DeviceProfile {
        dev_addr: dev_addr.to_string(),
        operator: summary.get("operator"),
        dev_eui: summary.get("dev_eui"),
        packet_count: summary.get("packet_count"),
        airtime_us: summary.get("airtime_us"),
        gateway_count: summary.get("gateway_count"),
        first_seen: summary.get("first_seen"),
        last_seen: summary.get("last_seen"),
        avg_rssi: summary.get("avg_rssi"),
        avg_snr: summary.get("avg_snr"),
        spreading_factors: sf_rows
            .iter()
            .map(|row| (row.get("spreading_factor"), row.get("packet_count")))
            .collect(),
    })
}

/// Recent packets for one device, newest first.
pub async fn device_timeline(
    store: &Store,
    dev_addr: &str,
    range: TimeRange,
    limit: i64,
) -> Result<Vec<PacketRow>, TraceError> {
    let rows = sqlx::query(
        r#"
        SELECT timestamp, gateway_id, packet_type, dev_addr, dev_eui, join_eui, operator,
               frequency, spreading_factor, rssi, snr, payload_size, airtime_us,
               f_cnt, f_port, confirmed
        FROM packets
        WHERE dev_addr = $1
          AND timestamp BETWEEN $2 AND $3
        ORDER BY timestamp DESC
        LIMIT $4
        "#,
    )
    .bind(dev_addr)
    .bind(range.start)
    .bind(range.end)
    .bind(limit.clamp(1, 1000))
    .fetch_all(store.pool())
    .await?;

    Ok(rows.iter().map(packet_row_from).collect())
}
