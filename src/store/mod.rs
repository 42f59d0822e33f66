//! # Persistent Store
//!
//! sqlx/Postgres access for the analyzer: connection pool, schema
//! migration, the insert/upsert statements used by the batched writer, and
//! the read-only query layer under [`queries`].

pub mod queries;
pub mod schema;
pub mod writer;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{QueryBuilder, Row};

use crate::error::TraceError;
use crate::live::GatewayText;
use crate::model::{CsPacket, GatewayUpsert, ParsedPacket};
use crate::operators::CustomOperator;

use writer::CsDeviceUpsert;

/// Shared handle to the database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect with a small pool; individual calls inherit the pool's
    /// connection timeout.
    pub async fn connect(url: &str) -> Result<Self, TraceError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Store { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply schema, aggregates and policies. Aggregate and policy
    /// statements are tolerated to fail on plain Postgres (no Timescale
    /// extension) with a warning, so development against a bare database
    /// still works.
    pub async fn migrate(&self) -> Result<(), TraceError> {
        for statement in schema::SCHEMA {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                if statement.contains("create_hypertable") {
                    log::warn!("hypertable setup failed (no timescaledb?): {e}");
                } else {
                    return Err(e.into());
                }
            }
        }
        for statement in schema::AGGREGATES.iter().chain(schema::POLICIES) {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                log::warn!("aggregate/policy setup failed: {e}");
            }
        }
        log::info!("schema migration complete");
        Ok(())
    }

    /// Multi-row insert of one flushed gateway batch.
    pub async fn insert_packets(&self, packets: &[ParsedPacket]) -> Result<(), TraceError> {
        if packets.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::new(
            "INSERT INTO packets (timestamp, gateway_id, border_gateway_id, packet_type, \
             dev_addr, join_eui, dev_eui, operator, frequency, spreading_factor, bandwidth, \
             rssi, snr, payload_size, airtime_us, f_cnt, f_port, confirmed, session_id) ",
        );
        builder.push_values(packets, |mut row, packet| {
            row.push_bind(packet.timestamp)
                .push_bind(&packet.gateway_id)
                .push_bind(&packet.border_gateway_id)
                .push_bind(packet.packet_type.as_str())
                .push_bind(&packet.dev_addr)
                .push_bind(&packet.join_eui)
                .push_bind(&packet.dev_eui)
                .push_bind(&packet.operator)
                .push_bind(packet.frequency)
                .push_bind(packet.spreading_factor)
                .push_bind(packet.bandwidth)
                .push_bind(packet.rssi)
                .push_bind(packet.snr)
                .push_bind(packet.payload_size)
                .push_bind(packet.airtime_us)
                .push_bind(packet.f_cnt)
                .push_bind(packet.f_port)
                .push_bind(packet.confirmed)
                .push_bind(&packet.session_id);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Multi-row insert of one flushed application batch.
    pub async fn insert_cs_packets(&self, packets: &[CsPacket]) -> Result<(), TraceError> {
        if packets.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::new(
            "INSERT INTO cs_packets (timestamp, dev_eui, dev_addr, device_name, \
             application_id, operator, frequency, spreading_factor, bandwidth, rssi, snr, \
             payload_size, airtime_us, f_cnt, f_port, confirmed) ",
        );
        builder.push_values(packets, |mut row, packet| {
            row.push_bind(packet.timestamp)
                .push_bind(&packet.dev_eui)
                .push_bind(&packet.dev_addr)
                .push_bind(&packet.device_name)
                .push_bind(&packet.application_id)
                .push_bind(&packet.operator)
                .push_bind(packet.frequency)
                .push_bind(packet.spreading_factor)
                .push_bind(packet.bandwidth)
                .push_bind(packet.rssi)
                .push_bind(packet.snr)
                .push_bind(packet.payload_size)
                .push_bind(packet.airtime_us)
                .push_bind(packet.f_cnt)
                .push_bind(packet.f_port)
                .push_bind(packet.confirmed);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Create-or-touch a gateway row. Fields not provided are preserved.
    pub async fn upsert_gateway(&self, upsert: &GatewayUpsert) -> Result<(), TraceError> {
        sqlx::query(
            r#"
            INSERT INTO gateways (gateway_id, name, alias, group_name, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (gateway_id) DO UPDATE SET
                name       = COALESCE(EXCLUDED.name, gateways.name),
                alias      = COALESCE(EXCLUDED.alias, gateways.alias),
                group_name = COALESCE(EXCLUDED.group_name, gateways.group_name),
                latitude   = COALESCE(EXCLUDED.latitude, gateways.latitude),
                longitude  = COALESCE(EXCLUDED.longitude, gateways.longitude),
                last_seen  = now()
            "#,
        )
        .bind(&upsert.gateway_id)
        .bind(&upsert.name)
        .bind(&upsert.alias)
        .bind(&upsert.group_name)
        .bind(upsert.latitude)
        .bind(upsert.longitude)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create-or-touch a device row; `packet_count` grows on every call.
    pub async fn upsert_cs_device(&self, upsert: &CsDeviceUpsert) -> Result<(), TraceError> {
        sqlx::query(
            r#"
            INSERT INTO cs_devices
                (dev_eui, dev_addr, device_name, application_id, application_name, packet_count)
            VALUES ($1, $2, $3, $4, $5, 1)
            ON CONFLICT (dev_eui) DO UPDATE SET
                dev_addr         = COALESCE(EXCLUDED.dev_addr, cs_devices.dev_addr),
                device_name      = EXCLUDED.device_name,
                application_id   = EXCLUDED.application_id,
                application_name = COALESCE(EXCLUDED.application_name, cs_devices.application_name),
                last_seen        = now(),
                packet_count     = cs_devices.packet_count + 1
            "#,
        )
        .bind(&upsert.dev_eui)
        .bind(&upsert.dev_addr)
        .bind(&upsert.device_name)
        .bind(&upsert.application_id)
        .bind(&upsert.application_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist config-supplied custom operators so reloads survive config
    /// removal, and read the merged set back.
    pub async fn sync_custom_operators(
        &self,
        from_config: &[CustomOperator],
    ) -> Result<Vec<CustomOperator>, TraceError> {
        for operator in from_config {
            for prefix in &operator.prefixes {
                sqlx::query(
                    r#"
                    INSERT INTO custom_operators (name, prefix, priority, color)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (name, prefix) DO UPDATE SET
                        priority = EXCLUDED.priority,
                        color    = COALESCE(EXCLUDED.color, custom_operators.color)
                    "#,
                )
                .bind(&operator.name)
                .bind(prefix)
                .bind(operator.priority.unwrap_or(crate::operators::CUSTOM_RULE_PRIORITY))
                .bind(&operator.color)
                .execute(&self.pool)
                .await?;
            }
        }
        self.load_custom_operators().await
    }

    /// Read custom operators from the table, one rule per prefix row.
    pub async fn load_custom_operators(&self) -> Result<Vec<CustomOperator>, TraceError> {
        let rows = sqlx::query(
            "SELECT name, prefix, priority, color FROM custom_operators ORDER BY name, prefix",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| CustomOperator {
                prefixes: vec![row.get::<String, _>("prefix")],
                name: row.get("name"),
                priority: Some(row.get::<i32, _>("priority")),
                color: row.get("color"),
            })
            .collect())
    }

    /// Persist config-supplied hide rules and read the full set back.
    pub async fn sync_hide_rules(
        &self,
        from_config: &[crate::config::HideRuleConfig],
    ) -> Result<Vec<crate::config::HideRuleConfig>, TraceError> {
        for rule in from_config {
            sqlx::query(
                r#"
                INSERT INTO hide_rules (rule_type, prefix, description)
                VALUES ($1, $2, $3)
                ON CONFLICT (rule_type, prefix) DO UPDATE SET
                    description = COALESCE(EXCLUDED.description, hide_rules.description)
                "#,
            )
            .bind(&rule.rule_type)
            .bind(&rule.prefix)
            .bind(&rule.description)
            .execute(&self.pool)
            .await?;
        }
        let rows = sqlx::query("SELECT rule_type, prefix, description FROM hide_rules")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| crate::config::HideRuleConfig {
                rule_type: row.get("rule_type"),
                prefix: row.get("prefix"),
                description: row.get("description"),
            })
            .collect())
    }

    /// Gateway text metadata for seeding the broadcaster cache at startup.
    pub async fn load_gateway_text(&self) -> Result<Vec<(String, GatewayText)>, TraceError> {
        let rows = sqlx::query("SELECT gateway_id, name, alias, group_name FROM gateways")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("gateway_id"),
                    GatewayText {
                        name: row.get("name"),
                        alias: row.get("alias"),
                        group_name: row.get("group_name"),
                    },
                )
            })
            .collect())
    }
}
