//! # Schema & Rollups
//!
//! DDL for the TimescaleDB-backed store: two hypertables (`packets`,
//! `cs_packets`), metadata tables, the `dev_addr_uint32` helper and two
//! continuous aggregates refreshed every 2 minutes over the trailing 3 days
//! and readable in real time beyond that. All streams and aggregates keep
//! 8 days; metadata tables keep everything.

/// Statements applied unconditionally at startup, in order.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS packets (
        timestamp         TIMESTAMPTZ NOT NULL,
        gateway_id        TEXT NOT NULL,
        border_gateway_id TEXT,
        packet_type       TEXT NOT NULL,
        dev_addr          TEXT,
        join_eui          TEXT,
        dev_eui           TEXT,
        operator          TEXT NOT NULL DEFAULT 'Unknown',
        frequency         BIGINT NOT NULL DEFAULT 0,
        spreading_factor  SMALLINT,
        bandwidth         BIGINT,
        rssi              INTEGER NOT NULL DEFAULT 0,
        snr               DOUBLE PRECISION NOT NULL DEFAULT 0,
        payload_size      INTEGER NOT NULL DEFAULT 0,
        airtime_us        BIGINT NOT NULL DEFAULT 0,
        f_cnt             BIGINT,
        f_port            SMALLINT,
        confirmed         BOOLEAN,
        session_id        TEXT
    )
    "#,
    "SELECT create_hypertable('packets', 'timestamp', if_not_exists => TRUE)",
    r#"
    CREATE INDEX IF NOT EXISTS packets_gateway_time_idx
        ON packets (gateway_id, timestamp DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS packets_dev_addr_time_idx
        ON packets (dev_addr, timestamp DESC) WHERE dev_addr IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS packets_type_time_idx
        ON packets (packet_type, timestamp DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cs_packets (
        timestamp        TIMESTAMPTZ NOT NULL,
        dev_eui          TEXT NOT NULL,
        dev_addr         TEXT,
        device_name      TEXT NOT NULL DEFAULT '',
        application_id   TEXT NOT NULL DEFAULT '',
        operator         TEXT NOT NULL DEFAULT '',
        frequency        BIGINT NOT NULL DEFAULT 0,
        spreading_factor SMALLINT,
        bandwidth        BIGINT,
        rssi             INTEGER NOT NULL DEFAULT 0,
        snr              DOUBLE PRECISION NOT NULL DEFAULT 0,
        payload_size     INTEGER NOT NULL DEFAULT 0,
        airtime_us       BIGINT NOT NULL DEFAULT 0,
        f_cnt            BIGINT,
        f_port           SMALLINT,
        confirmed        BOOLEAN
    )
    "#,
    "SELECT create_hypertable('cs_packets', 'timestamp', if_not_exists => TRUE)",
    r#"
    CREATE INDEX IF NOT EXISTS cs_packets_dev_eui_time_idx
        ON cs_packets (dev_eui, timestamp DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gateways (
        gateway_id TEXT PRIMARY KEY,
        name       TEXT,
        alias      TEXT,
        group_name TEXT,
        first_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_seen  TIMESTAMPTZ NOT NULL DEFAULT now(),
        latitude   DOUBLE PRECISION,
        longitude  DOUBLE PRECISION
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cs_devices (
        dev_eui          TEXT PRIMARY KEY,
        dev_addr         TEXT,
        device_name      TEXT NOT NULL DEFAULT '',
        application_id   TEXT NOT NULL DEFAULT '',
        application_name TEXT,
        last_seen        TIMESTAMPTZ NOT NULL DEFAULT now(),
        packet_count     BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS custom_operators (
        name     TEXT NOT NULL,
        prefix   TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 100,
        color    TEXT,
        PRIMARY KEY (name, prefix)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hide_rules (
        rule_type   TEXT NOT NULL,
        prefix      TEXT NOT NULL,
        description TEXT,
        PRIMARY KEY (rule_type, prefix)
    )
    "#,
    // big-endian hex DevAddr -> numeric form for prefix arithmetic in SQL
    r#"
    CREATE OR REPLACE FUNCTION dev_addr_uint32(addr TEXT) RETURNS BIGINT
    LANGUAGE SQL IMMUTABLE AS $$
        SELECT CASE
            WHEN addr ~ '^[0-9A-Fa-f]{8}$'
            THEN ('x' || addr)::bit(32)::bigint
            ELSE NULL
        END
    $$
    "#,
];

/// Continuous aggregates. `unique_devices` in `packets_hourly` counts
/// distinct devices within one (hour, gateway, operator, type) cell and is
/// NOT summable across any dimension; readers that need distinct counts
/// across cells recompute from raw `packets`.
pub const AGGREGATES: &[&str] = &[
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS packets_hourly
    WITH (timescaledb.continuous) AS
    SELECT
        time_bucket('1 hour', timestamp) AS bucket,
        gateway_id,
        operator,
        packet_type,
        COUNT(*)                 AS packet_count,
        SUM(airtime_us)          AS airtime_us,
        COUNT(DISTINCT dev_addr) AS unique_devices
    FROM packets
    GROUP BY bucket, gateway_id, operator, packet_type
    WITH NO DATA
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS packets_channel_sf_hourly
    WITH (timescaledb.continuous) AS
    SELECT
        time_bucket('1 hour', timestamp) AS bucket,
        gateway_id,
        frequency,
        COALESCE(spreading_factor, 0) AS spreading_factor,
        COUNT(*)        AS packet_count,
        SUM(airtime_us) AS airtime_us
    FROM packets
    GROUP BY bucket, gateway_id, frequency, COALESCE(spreading_factor, 0)
    WITH NO DATA
    "#,
];

/// Refresh and retention policies; idempotent.
pub const POLICIES: &[&str] = &[
    r#"
    SELECT add_continuous_aggregate_policy('packets_hourly',
        start_offset      => INTERVAL '3 days',
        end_offset        => INTERVAL '0',
        schedule_interval => INTERVAL '2 minutes',
        if_not_exists     => TRUE)
    "#,
    r#"
    SELECT add_continuous_aggregate_policy('packets_channel_sf_hourly',
        start_offset      => INTERVAL '3 days',
        end_offset        => INTERVAL '0',
        schedule_interval => INTERVAL '2 minutes',
        if_not_exists     => TRUE)
    "#,
    "SELECT add_retention_policy('packets', INTERVAL '8 days', if_not_exists => TRUE)",
    "SELECT add_retention_policy('cs_packets', INTERVAL '8 days', if_not_exists => TRUE)",
    "SELECT add_retention_policy('packets_hourly', INTERVAL '8 days', if_not_exists => TRUE)",
    "SELECT add_retention_policy('packets_channel_sf_hourly', INTERVAL '8 days', if_not_exists => TRUE)",
];
