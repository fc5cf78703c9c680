use async_trait::async_trait;
use sqlx::Row;

use crate::error::Result;
use crate::store::{MaintenanceStore, watermark};

use super::PgStore;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

#[async_trait]
impl MaintenanceStore for PgStore {
    async fn get_watermark(&self, table: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT last_processed_ts FROM aggregate_state WHERE table_name = $1",
        )
        .bind(table)
        .fetch_optional(self.pool())
        .await?;
        Ok(row
            .map(|r| r.try_get("last_processed_ts"))
            .transpose()?
            .unwrap_or(0))
    }

    async fn set_watermark(&self, table: &str, ts_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO aggregate_state (table_name, last_processed_ts)
            VALUES ($1, $2)
            ON CONFLICT (table_name) DO UPDATE SET
                last_processed_ts = GREATEST(aggregate_state.last_processed_ts, EXCLUDED.last_processed_ts)
            "#,
        )
        .bind(table)
        .bind(ts_ms)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn run_minute_rollup(&self, horizon_ms: i64) -> Result<i64> {
        // Only complete buckets strictly below the horizon are rolled up. The
        // bucket containing the watermark is recomputed wholesale, which keeps
        // the upsert idempotent without merge arithmetic.
        let horizon = (horizon_ms / MINUTE_MS) * MINUTE_MS;
        let current = self.get_watermark(watermark::TELEMETRY_1M).await?;
        if horizon <= current {
            return Ok(current);
        }

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO telemetry_1m (device_id, tag_id, ts_bucket, min_value, max_value, avg_value, first_value, last_value, sample_count)
            SELECT device_id, tag_id, (ts / 60000) * 60000 AS ts_bucket,
                   MIN(value_num),
                   MAX(value_num),
                   AVG(value_num),
                   (ARRAY_AGG(value_num ORDER BY ts ASC, seq ASC))[1],
                   (ARRAY_AGG(value_num ORDER BY ts DESC, seq DESC))[1],
                   COUNT(*)
            FROM telemetry
            WHERE ts >= ($1 / 60000) * 60000
              AND ts < $2
              AND value_num IS NOT NULL
            GROUP BY device_id, tag_id, (ts / 60000) * 60000
            ON CONFLICT (device_id, tag_id, ts_bucket) DO UPDATE SET
                min_value = EXCLUDED.min_value,
                max_value = EXCLUDED.max_value,
                avg_value = EXCLUDED.avg_value,
                first_value = EXCLUDED.first_value,
                last_value = EXCLUDED.last_value,
                sample_count = EXCLUDED.sample_count
            "#,
        )
        .bind(current)
        .bind(horizon)
        .execute(&mut *tx)
        .await?;

        // The watermark advances in the same transaction as the rollup so a
        // crash can never leave pruned-but-unaggregated samples.
        let new_watermark = horizon - 1;
        sqlx::query(
            "UPDATE aggregate_state SET last_processed_ts = GREATEST(last_processed_ts, $2) WHERE table_name = $1",
        )
        .bind(watermark::TELEMETRY_1M)
        .bind(new_watermark)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(new_watermark)
    }

    async fn run_hour_rollup(&self, horizon_ms: i64) -> Result<i64> {
        let horizon = (horizon_ms / HOUR_MS) * HOUR_MS;
        let current = self.get_watermark(watermark::TELEMETRY_1H).await?;
        if horizon <= current {
            return Ok(current);
        }

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO telemetry_1h (device_id, tag_id, ts_bucket, min_value, max_value, avg_value, first_value, last_value, sample_count)
            SELECT device_id, tag_id, (ts_bucket / 3600000) * 3600000 AS hour_bucket,
                   MIN(min_value),
                   MAX(max_value),
                   SUM(avg_value * sample_count) / NULLIF(SUM(sample_count), 0),
                   (ARRAY_AGG(first_value ORDER BY ts_bucket ASC))[1],
                   (ARRAY_AGG(last_value ORDER BY ts_bucket DESC))[1],
                   SUM(sample_count)
            FROM telemetry_1m
            WHERE ts_bucket >= ($1 / 3600000) * 3600000
              AND ts_bucket < $2
            GROUP BY device_id, tag_id, (ts_bucket / 3600000) * 3600000
            ON CONFLICT (device_id, tag_id, ts_bucket) DO UPDATE SET
                min_value = EXCLUDED.min_value,
                max_value = EXCLUDED.max_value,
                avg_value = EXCLUDED.avg_value,
                first_value = EXCLUDED.first_value,
                last_value = EXCLUDED.last_value,
                sample_count = EXCLUDED.sample_count
            "#,
        )
        .bind(current)
        .bind(horizon)
        .execute(&mut *tx)
        .await?;

        let new_watermark = horizon - 1;
        sqlx::query(
            "UPDATE aggregate_state SET last_processed_ts = GREATEST(last_processed_ts, $2) WHERE table_name = $1",
        )
        .bind(watermark::TELEMETRY_1H)
        .bind(new_watermark)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(new_watermark)
    }

    async fn delete_telemetry_before(&self, cutoff_ms: i64) -> Result<u64> {
        // The watermark guard lives in the statement itself: rows above the
        // minute watermark survive regardless of the cutoff.
        let result = sqlx::query(
            r#"
            DELETE FROM telemetry
            WHERE ts < $1
              AND ts <= (SELECT last_processed_ts FROM aggregate_state WHERE table_name = $2)
            "#,
        )
        .bind(cutoff_ms)
        .bind(watermark::TELEMETRY_1M)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_minute_before(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM telemetry_1m
            WHERE ts_bucket < $1
              AND ts_bucket <= (SELECT last_processed_ts FROM aggregate_state WHERE table_name = $2)
            "#,
        )
        .bind(cutoff_ms)
        .bind(watermark::TELEMETRY_1H)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
