//! Gateway reads: the gateway list with traffic counters, and the
//! per-gateway operator → device tree.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use super::TimeRange;
use crate::error::TraceError;
use crate::store::Store;

/// Gateways with fewer packets than this in the window are hidden.
const MIN_PACKETS_SHOWN: i64 = 10;

/// One row of the gateway list.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayListEntry {
    pub gateway_id: String,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub group_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub packet_count: i64,
    pub airtime_us: i64,
    pub unique_devices: i64,
}

/// Gateway list over the window.
///
/// Packet and airtime totals come from `packets_hourly`; distinct device
/// counts are recomputed from raw `packets` because per-hour distinct
/// counts cannot be summed.
pub async fn gateway_list(
    store: &Store,
    range: TimeRange,
) -> Result<Vec<GatewayListEntry>, TraceError> {
    let traffic = sqlx::query(
        r#"
        SELECT gateway_id,
               SUM(packet_count)::BIGINT AS packet_count,
               COALESCE(SUM(airtime_us), 0)::BIGINT AS airtime_us
        FROM packets_hourly
        WHERE bucket BETWEEN $1 AND $2
        GROUP BY gateway_id
        HAVING SUM(packet_count) >= $3
        ORDER BY SUM(packet_count) DESC
        "#,
    )
    .bind(range.start)
    .bind(range.end)
    .bind(MIN_PACKETS_SHOWN)
    .fetch_all(store.pool())
    .await?;

    if traffic.is_empty() {
        return Ok(Vec::new());
    }

    let devices = sqlx::query(
        r#"
        SELECT gateway_id, COUNT(DISTINCT dev_addr)::BIGINT AS unique_devices
        FROM packets
        WHERE timestamp BETWEEN $1 AND $2 AND dev_addr IS NOT NULL
        GROUP BY gateway_id
        "#,
    )
    .bind(range.start)
    .bind(range.end)
    .fetch_all(store.pool())
    .await?;
    let device_counts: HashMap<String, i64> = devices
        .iter()
        .map(|row| (row.get("gateway_id"), row.get("unique_devices")))
        .collect();

    let meta_rows = sqlx::query(
        "SELECT gateway_id, name, alias, group_name, latitude, longitude, last_seen FROM gateways",
    )
    .fetch_all(store.pool())
    .await?;
    let meta: HashMap<String, &sqlx::postgres::PgRow> = meta_rows
        .iter()
        .map(|row| (row.get::<String, _>("gateway_id"), row))
        .collect();

    Ok(traffic
        .iter()
        .map(|row| {
            let gateway_id: String = row.get("gateway_id");
            let gateway_meta = meta.get(&gateway_id);
            GatewayListEntry {
                packet_count: row.get("packet_count"),
                airtime_us: row.get("airtime_us"),
                unique_devices: device_counts.get(&gateway_id).copied().unwrap_or(0),
                name: gateway_meta.and_then(|m| m.get("name")),
                alias: gateway_meta.and_then(|m| m.get("alias")),
                group_name: gateway_meta.and_then(|m| m.get("group_name")),
                latitude: gateway_meta.and_then(|m| m.get("latitude")),
                longitude: gateway_meta.and_then(|m| m.get("longitude")),
                last_seen: gateway_meta.map(|m| m.get("last_seen")),
                gateway_id,
            }
        })
        .collect())
}

/// One device under an operator in the gateway tree.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayTreeDevice {
    pub dev_addr: String,
    pub dev_eui: Option<String>,
    pub packet_count: i64,
    pub last_seen: DateTime<Utc>,
    pub avg_rssi: f64,
}

/// One operator branch of the per-gateway tree.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayTreeNode {
    pub operator: String,
    pub packet_count: i64,
    pub devices: Vec<GatewayTreeDevice>,
}

/// Operator → device tree for one gateway over the window, ordered by
/// traffic.
pub async fn gateway_tree(
    store: &Store,
    gateway_id: &str,
    range: TimeRange,
) -> Result<Vec<GatewayTreeNode>, TraceError> {
    let rows = sqlx::query(
        r#"
        SELECT operator, dev_addr,
               MAX(dev_eui)     AS dev_eui,
               COUNT(*)::BIGINT AS packet_count,
               MAX(timestamp)   AS last_seen,
               AVG(rssi)::FLOAT8 AS avg_rssi
        FROM packets
        WHERE gateway_id = $1
          AND dev_addr IS NOT NULL
          AND timestamp BETWEEN $2 AND $3
        GROUP BY operator, dev_addr
        ORDER BY operator, COUNT(*) DESC
        "#,
    )
    .bind(gateway_id)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(store.pool())
    .await?;

    let mut nodes: Vec<GatewayTreeNode> = Vec::new();
    for row in &rows {
        let operator: String = row.get("operator");
        let device = GatewayTreeDevice {
            dev_addr: row.get("dev_addr"),
            dev_eui: row.get("dev_eui"),
            packet_count: row.get("packet_count"),
            last_seen: row.get("last_seen"),
            avg_rssi: row.get::<Option<f64>, _>("avg_rssi").unwrap_or(0.0),
        };
        match nodes.last_mut() {
            Some(node) if node.operator == operator => {
                node.packet_count += device.packet_count;
                node.devices.push(device);
            }
            _ => nodes.push(GatewayTreeNode {
                operator,
                packet_count: device.packet_count,
                devices: vec![device],
            }),
        }
    }
    nodes.sort_by(|a, b| b.packet_count.cmp(&a.packet_count));
    Ok(nodes)
}
