use async_trait::async_trait;
use sqlx::{QueryBuilder, Row};

use galvan_model::prelude::*;

use crate::error::Result;
use crate::store::{
    AggregateBucket, AggregateFn, RangeCursor, RangePage, RangeQuery, TelemetryStore,
};

use super::PgStore;

/// Rows per multi-row INSERT; keeps bind counts well under the Postgres
/// parameter limit (8 binds per row).
const INSERT_CHUNK: usize = 1_000;

#[async_trait]
impl TelemetryStore for PgStore {
    async fn append_batch(&self, points: &[TelemetryPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;

        for chunk in points.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO telemetry (device_id, tag_id, ts, seq, value, value_num, quality, unit) ",
            );
            let rows: Vec<_> = chunk
                .iter()
                .map(|p| Self::value_columns(p).map(|cols| (p, cols)))
                .collect::<Result<_>>()?;
            builder.push_values(rows.iter(), |mut b, (p, (json, num))| {
                b.push_bind(p.device_id.to_uuid())
                    .push_bind(p.tag_id.as_str().to_owned())
                    .push_bind(p.ts_ms)
                    .push_bind(p.seq as i64)
                    .push_bind(json.clone())
                    .push_bind(*num)
                    .push_bind(p.quality.0 as i16)
                    .push_bind(p.unit.clone());
            });
            builder.push(" ON CONFLICT (device_id, tag_id, ts, seq) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }

        // Refresh the latest-value table so get_latest never needs a raw scan.
        // One row per series: a multi-row upsert may not touch the same
        // conflict key twice.
        let mut newest: std::collections::HashMap<(DeviceId, TagId), &TelemetryPoint> =
            std::collections::HashMap::new();
        for p in points {
            newest
                .entry((p.device_id, p.tag_id.clone()))
                .and_modify(|current| {
                    if (p.ts_ms, p.seq) > (current.ts_ms, current.seq) {
                        *current = p;
                    }
                })
                .or_insert(p);
        }
        let newest: Vec<&TelemetryPoint> = newest.into_values().collect();

        for chunk in newest.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO telemetry_latest (device_id, tag_id, ts, seq, value, value_num, quality, unit) ",
            );
            let rows: Vec<_> = chunk
                .iter()
                .map(|p| Self::value_columns(p).map(|cols| (*p, cols)))
                .collect::<Result<_>>()?;
            builder.push_values(rows.iter(), |mut b, (p, (json, num))| {
                b.push_bind(p.device_id.to_uuid())
                    .push_bind(p.tag_id.as_str().to_owned())
                    .push_bind(p.ts_ms)
                    .push_bind(p.seq as i64)
                    .push_bind(json.clone())
                    .push_bind(*num)
                    .push_bind(p.quality.0 as i16)
                    .push_bind(p.unit.clone());
            });
            builder.push(
                " ON CONFLICT (device_id, tag_id) DO UPDATE SET \
                 ts = EXCLUDED.ts, seq = EXCLUDED.seq, value = EXCLUDED.value, \
                 value_num = EXCLUDED.value_num, quality = EXCLUDED.quality, unit = EXCLUDED.unit \
                 WHERE (EXCLUDED.ts, EXCLUDED.seq) > (telemetry_latest.ts, telemetry_latest.seq)",
            );
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_latest(
        &self,
        device_id: Option<DeviceId>,
        tag_id: Option<&TagId>,
    ) -> Result<Vec<TelemetryPoint>> {
        let mut builder = QueryBuilder::new(
            "SELECT device_id, tag_id, ts, seq, value, quality, unit FROM telemetry_latest WHERE 1=1",
        );
        if let Some(device_id) = device_id {
            builder.push(" AND device_id = ").push_bind(device_id.to_uuid());
        }
        if let Some(tag_id) = tag_id {
            builder.push(" AND tag_id = ").push_bind(tag_id.as_str().to_owned());
        }
        builder.push(" ORDER BY device_id, tag_id");

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter().map(Self::point_from_row).collect()
    }

    async fn query_range(&self, query: RangeQuery) -> Result<RangePage> {
        let limit = query.limit.clamp(1, 10_000);

        let mut builder = QueryBuilder::new(
            "SELECT device_id, tag_id, ts, seq, value, quality, unit FROM telemetry WHERE 1=1",
        );
        if let Some(device_id) = query.device_id {
            builder.push(" AND device_id = ").push_bind(device_id.to_uuid());
        }
        if let Some(tag_id) = &query.tag_id {
            builder.push(" AND tag_id = ").push_bind(tag_id.as_str().to_owned());
        }
        if let Some(start) = query.start_ms {
            builder.push(" AND ts >= ").push_bind(start);
        }
        if let Some(end) = query.end_ms {
            builder.push(" AND ts <= ").push_bind(end);
        }
        if let Some(cursor) = query.cursor {
            builder
                .push(" AND (ts, seq) > (")
                .push_bind(cursor.ts_ms)
                .push(", ")
                .push_bind(cursor.seq)
                .push(")");
        }
        builder.push(" ORDER BY ts, seq LIMIT ").push_bind(limit + 1);

        let rows = builder.build().fetch_all(self.pool()).await?;
        let has_more = rows.len() as i64 > limit;
        let points = rows
            .iter()
            .take(limit as usize)
            .map(Self::point_from_row)
            .collect::<Result<Vec<_>>>()?;

        let next_cursor = if has_more {
            points.last().map(|p| RangeCursor {
                ts_ms: p.ts_ms,
                seq: p.seq as i64,
            })
        } else {
            None
        };

        Ok(RangePage {
            points,
            next_cursor,
        })
    }

    async fn aggregate(
        &self,
        device_id: DeviceId,
        tag_id: &TagId,
        start_ms: i64,
        end_ms: i64,
        bucket_ms: i64,
        func: AggregateFn,
    ) -> Result<Vec<AggregateBucket>> {
        let bucket_ms = bucket_ms.max(1);
        let mut builder = QueryBuilder::new("SELECT (ts / ");
        builder.push_bind(bucket_ms);
        builder.push(") * ");
        builder.push_bind(bucket_ms);
        builder.push(" AS bucket_start, ");
        builder.push(func.as_sql());
        builder.push("(value_num)::double precision AS agg FROM telemetry WHERE device_id = ");
        builder.push_bind(device_id.to_uuid());
        builder.push(" AND tag_id = ");
        builder.push_bind(tag_id.as_str().to_owned());
        builder.push(" AND ts >= ");
        builder.push_bind(start_ms);
        builder.push(" AND ts < ");
        builder.push_bind(end_ms);
        builder.push(" AND value_num IS NOT NULL GROUP BY bucket_start ORDER BY bucket_start");

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| {
                Ok(AggregateBucket {
                    bucket_start_ms: row.try_get("bucket_start")?,
                    value: row.try_get("agg")?,
                })
            })
            .collect()
    }
}
