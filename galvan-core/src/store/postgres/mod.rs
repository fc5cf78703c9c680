//! Postgres implementation of the persistence ports.
//!
//! One [`PgStore`] over a shared [`PgPool`] implements every port; the trait
//! impls live in sibling modules, one per concern. Queries are runtime-bound
//! (`sqlx::query` + `try_get`) so the crate builds without a live database.

mod alarms;
mod baselines;
mod collection;
mod devices;
mod maintenance;
mod telemetry;

use std::fmt;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use galvan_model::prelude::*;

use crate::error::{CoreError, Result};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl fmt::Debug for PgStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PgStore {
    /// Connect and run embedded migrations. A failure here is fatal startup:
    /// the process must abort before accepting traffic.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Increment the config revision inside an open transaction. Every write
    /// path that mutates devices, tags, or rules calls this exactly once.
    pub(crate) async fn bump_revision(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE config_revision SET revision = revision + 1 WHERE id = 1 RETURNING revision",
        )
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.try_get::<i64, _>("revision")?)
    }

    pub(crate) fn point_from_row(row: &PgRow) -> Result<TelemetryPoint> {
        let device_id: uuid::Uuid = row.try_get("device_id")?;
        let tag_id: String = row.try_get("tag_id")?;
        let ts: i64 = row.try_get("ts")?;
        let seq: i64 = row.try_get("seq")?;
        let value: serde_json::Value = row.try_get("value")?;
        let quality: i16 = row.try_get("quality")?;
        let unit: Option<String> = row.try_get("unit")?;

        let value: TelemetryValue = serde_json::from_value(value)
            .map_err(|e| CoreError::Internal(format!("Undecodable telemetry value: {e}")))?;

        Ok(TelemetryPoint {
            device_id: device_id.into(),
            tag_id: tag_id.into(),
            ts_ms: ts,
            seq: seq as u64,
            value,
            quality: Quality(quality as u8),
            unit,
        })
    }

    pub(crate) fn value_columns(point: &TelemetryPoint) -> Result<(serde_json::Value, Option<f64>)> {
        let json = serde_json::to_value(&point.value)?;
        Ok((json, point.value.as_f64()))
    }
}
