#![cfg(feature = "db")]
//! Postgres-backed state store.
//!
//! Enum columns hold the lowercase names (`cool`, `solar_panel`, ...), the
//! same strings the API speaks. Queries are checked at runtime so the crate
//! builds without a live database.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::info;

use super::{integrate_steps, net_grid_power, StateStore, StoreError};
use crate::config::StoreConfig;
use crate::domain::{AntiDustState, HvacState, Reading, RelayState, SensorKind};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS readings (
        id BIGSERIAL PRIMARY KEY,
        sensor TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS readings_sensor_ts ON readings (sensor, timestamp DESC)",
    r#"CREATE TABLE IF NOT EXISTS relay_states (
        id BIGSERIAL PRIMARY KEY,
        supply_source TEXT NOT NULL,
        house_source TEXT NOT NULL,
        power_supply_w DOUBLE PRECISION NOT NULL,
        power_house_w DOUBLE PRECISION NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS hvac_states (
        id BIGSERIAL PRIMARY KEY,
        power_w DOUBLE PRECISION NOT NULL,
        status TEXT NOT NULL,
        mode TEXT NOT NULL,
        target_temp_c DOUBLE PRECISION NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS anti_dust_states (
        id BIGSERIAL PRIMARY KEY,
        mode TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
];

pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub async fn connect(cfg: &StoreConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.url)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        info!(max_connections = cfg.max_connections, "postgres state store ready");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables if they do not exist yet.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_column<T: FromStr>(column: &str, raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Backend(format!("unexpected {column} value {raw:?}")))
}

fn relay_from_row(row: &sqlx::postgres::PgRow) -> Result<RelayState, StoreError> {
    Ok(RelayState {
        supply_source: parse_column("supply_source", row.try_get("supply_source")?)?,
        house_source: parse_column("house_source", row.try_get("house_source")?)?,
        power_supply_w: row.try_get("power_supply_w")?,
        power_house_w: row.try_get("power_house_w")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn hvac_from_row(row: &sqlx::postgres::PgRow) -> Result<HvacState, StoreError> {
    Ok(HvacState {
        power_w: row.try_get("power_w")?,
        status: parse_column("status", row.try_get("status")?)?,
        mode: parse_column("mode", row.try_get("mode")?)?,
        target_temp_c: row.try_get("target_temp_c")?,
        timestamp: row.try_get("timestamp")?,
    })
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO readings (sensor, value, timestamp) VALUES ($1, $2, $3)")
            .bind(reading.sensor.as_ref())
            .bind(reading.value)
            .bind(reading.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest(&self, sensor: SensorKind, n: usize) -> Result<Vec<Reading>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT value, timestamp FROM readings
            WHERE sensor = $1
            ORDER BY timestamp DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(sensor.as_ref())
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Reading {
                    sensor,
                    value: row.try_get("value")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn insert_relay(&self, relay: &RelayState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO relay_states (supply_source, house_source, power_supply_w, power_house_w, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(relay.supply_source.as_ref())
        .bind(relay.house_source.as_ref())
        .bind(relay.power_supply_w)
        .bind(relay.power_house_w)
        .bind(relay.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_hvac(&self, hvac: &HvacState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO hvac_states (power_w, status, mode, target_temp_c, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(hvac.power_w)
        .bind(hvac.status.as_ref())
        .bind(hvac.mode.as_ref())
        .bind(hvac.target_temp_c)
        .bind(hvac.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_anti_dust(&self, state: &AntiDustState) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO anti_dust_states (mode, timestamp) VALUES ($1, $2)")
            .bind(state.mode.as_ref())
            .bind(state.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_relay(&self) -> Result<Option<RelayState>, StoreError> {
        sqlx::query("SELECT * FROM relay_states ORDER BY timestamp DESC, id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(relay_from_row)
            .transpose()
    }

    async fn latest_hvac(&self) -> Result<Option<HvacState>, StoreError> {
        sqlx::query("SELECT * FROM hvac_states ORDER BY timestamp DESC, id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(hvac_from_row)
            .transpose()
    }

    async fn latest_anti_dust(&self) -> Result<Option<AntiDustState>, StoreError> {
        let row = sqlx::query(
            "SELECT mode, timestamp FROM anti_dust_states ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(AntiDustState {
                mode: parse_column("mode", row.try_get("mode")?)?,
                timestamp: row.try_get("timestamp")?,
            })
        })
        .transpose()
    }

    async fn aggregate_power_over_window(&self, window: Duration) -> Result<f64, StoreError> {
        let end = Utc::now();
        let start = end - window;
        // The last row before the window still holds at its start.
        let rows = sqlx::query(
            r#"
            (SELECT * FROM hvac_states WHERE timestamp < $1 ORDER BY timestamp DESC LIMIT 1)
            UNION ALL
            (SELECT * FROM hvac_states WHERE timestamp >= $1)
            ORDER BY timestamp ASC
            "#,
        )
        .bind(start)
        .fetch_all(&self.pool)
        .await?;

        let samples = rows
            .iter()
            .map(|row| hvac_from_row(row).map(|h| (h.timestamp, h.power_w)))
            .collect::<Result<Vec<(DateTime<Utc>, f64)>, _>>()?;
        Ok(integrate_steps(&samples, start, end))
    }

    async fn aggregate_net_grid_balance(&self, window: Duration) -> Result<f64, StoreError> {
        let end = Utc::now();
        let start = end - window;
        let rows = sqlx::query(
            r#"
            (SELECT * FROM relay_states WHERE timestamp < $1 ORDER BY timestamp DESC LIMIT 1)
            UNION ALL
            (SELECT * FROM relay_states WHERE timestamp >= $1)
            ORDER BY timestamp ASC
            "#,
        )
        .bind(start)
        .fetch_all(&self.pool)
        .await?;

        let samples = rows
            .iter()
            .map(|row| relay_from_row(row).map(|r| (r.timestamp, net_grid_power(&r))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(integrate_steps(&samples, start, end))
    }
}
