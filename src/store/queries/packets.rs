//! Recent-packet and join-activity reads.
//!
//! The recent-packets query is assembled from a parameter bag into a single
//! parameterized statement; an empty bag degrades to an unfiltered window
//! scan. Hide rules (DevAddr / JoinEUI prefixes) are applied as NOT-LIKE
//! guards.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Row};

use super::{packet_row_from, PacketRow, TimeRange};
use crate::config::HideRuleConfig;
use crate::error::TraceError;
use crate::model::PacketType;
use crate::store::Store;

/// Compiled suppression rule.
#[derive(Debug, Clone, PartialEq)]
pub enum HideRule {
    DevAddrPrefix(String),
    JoinEuiPrefix(String),
}

impl HideRule {
    /// Build from config rows; unknown types are skipped with a warning.
    pub fn from_config(rules: &[HideRuleConfig]) -> Vec<HideRule> {
        rules
            .iter()
            .filter_map(|rule| match rule.rule_type.as_str() {
                "dev_addr" => Some(HideRule::DevAddrPrefix(rule.prefix.to_ascii_uppercase())),
                "join_eui" => Some(HideRule::JoinEuiPrefix(rule.prefix.to_ascii_uppercase())),
                other => {
                    log::warn!("ignoring hide rule with unknown type {other:?}");
                    None
                }
            })
            .collect()
    }
}

fn push_hide_rules(builder: &mut QueryBuilder<'_, sqlx::Postgres>, rules: &[HideRule]) {
    for rule in rules {
        match rule {
            HideRule::DevAddrPrefix(prefix) => {
                builder.push(" AND (dev_addr IS NULL OR dev_addr NOT LIKE ");
                builder.push_bind(format!("{prefix}%"));
                builder.push(")");
            }
            HideRule::JoinEuiPrefix(prefix) => {
                builder.push(" AND (join_eui IS NULL OR join_eui NOT LIKE ");
                builder.push_bind(format!("{prefix}%"));
                builder.push(")");
            }
        }
    }
}

/// Parameter bag for the recent-packets read. Everything is optional; the
/// degenerate case is a plain window scan.
#[derive(Debug, Clone, Default)]
pub struct RecentPacketsParams {
    pub gateway_id: Option<String>,
    pub packet_types: Vec<PacketType>,
    pub operator: Option<String>,
    pub dev_addr: Option<String>,
    /// Case-insensitive substring over id/operator text columns.
    pub search: Option<String>,
    pub hide_rules: Vec<HideRule>,
    pub limit: i64,
}

/// Latest packets matching the bag, newest first.
pub async fn recent_packets(
    store: &Store,
    range: TimeRange,
    params: &RecentPacketsParams,
) -> Result<Vec<PacketRow>, TraceError> {
    let mut builder = QueryBuilder::new(
        "SELECT timestamp, gateway_id, packet_type, dev_addr, dev_eui, join_eui, operator, \
         frequency, spreading_factor, rssi, snr, payload_size, airtime_us, f_cnt, f_port, \
         confirmed FROM packets WHERE timestamp BETWEEN ",
    );
    builder.push_bind(range.start);
    builder.push(" AND ");
    builder.push_bind(range.end);

    if let Some(gateway_id) = &params.gateway_id {
        builder.push(" AND gateway_id = ");
        builder.push_bind(gateway_id);
    }
    if !params.packet_types.is_empty() {
        builder.push(" AND packet_type IN (");
        let mut separated = builder.separated(", ");
        for packet_type in &params.packet_types {
            separated.push_bind(packet_type.as_str());
        }
        builder.push(")");
    }
    if let Some(operator) = &params.operator {
        builder.push(" AND operator = ");
        builder.push_bind(operator);
    }
    if let Some(dev_addr) = &params.dev_addr {
        builder.push(" AND dev_addr = ");
        builder.push_bind(dev_addr);
    }
    if let Some(search) = &params.search {
        let pattern = format!("%{}%", search.replace('%', "\\%").replace('_', "\\_"));
        builder.push(
            " AND (gateway_id ILIKE ",
        );
        builder.push_bind(pattern.clone());
        builder.push(" OR operator ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR dev_addr ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR dev_eui ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR join_eui ILIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
    push_hide_rules(&mut builder, &params.hide_rules);

    builder.push(" ORDER BY timestamp DESC LIMIT ");
    builder.push_bind(if params.limit > 0 {
        params.limit.min(1000)
    } else {
        100
    });

    let rows = builder.build().fetch_all(store.pool()).await?;
    Ok(rows.iter().map(packet_row_from).collect())
}

/// One device's join activity in the window.
#[derive(Debug, Clone, Serialize)]
pub struct JoinActivityRow {
    pub join_eui: String,
    pub dev_eui: String,
    pub operator: String,
    pub join_count: i64,
    pub gateway_count: i64,
    pub last_seen: DateTime<Utc>,
}

/// Join requests grouped by (JoinEUI, DevEUI), most recent first. A device
/// joining in a loop shows up at the top of this list.
pub async fn join_activity(
    store: &Store,
    range: TimeRange,
    hide_rules: &[HideRule],
    limit: i64,
) -> Result<Vec<JoinActivityRow>, TraceError> {
    let mut builder = QueryBuilder::new(
        "SELECT join_eui, dev_eui, MAX(operator) AS operator, COUNT(*)::BIGINT AS join_count, \
         COUNT(DISTINCT gateway_id)::BIGINT AS gateway_count, MAX(timestamp) AS last_seen \
         FROM packets WHERE packet_type = 'join_request' \
         AND join_eui IS NOT NULL AND dev_eui IS NOT NULL AND timestamp BETWEEN ",
    );
    builder.push_bind(range.start);
    builder.push(" AND ");
    builder.push_bind(range.end);
    push_hide_rules(&mut builder, hide_rules);
    builder.push(" GROUP BY join_eui, dev_eui ORDER BY MAX(timestamp) DESC LIMIT ");
    builder.push_bind(limit.clamp(1, 1000));

    let rows = builder.build().fetch_all(store.pool()).await?;
    Ok(rows
        .iter()
        .map(|row| JoinActivityRow {
            join_eui: row.get("join_eui"),
            dev_eui: row.get("dev_eui"),
            operator: row.get("operator"),
            join_count: row.get("join_count"),
            gateway_count: row.get("gateway_count"),
            last_seen: row.get("last_seen"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hide_rules_from_config() {
        let rules = HideRule::from_config(&[
            HideRuleConfig {
                rule_type: "dev_addr".into(),
                prefix: "fe".into(),
                description: None,
            },
            HideRuleConfig {
                rule_type: "join_eui".into(),
                prefix: "70B3".into(),
                description: None,
            },
            HideRuleConfig {
                rule_type: "bogus".into(),
                prefix: "00".into(),
                description: None,
            },
        ]);
        assert_eq!(
            rules,
            vec![
                HideRule::DevAddrPrefix("FE".into()),
                HideRule::JoinEuiPrefix("70B3".into()),
            ]
        );
    }
}
