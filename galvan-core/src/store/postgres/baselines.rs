use async_trait::async_trait;
use sqlx::Row;

use galvan_model::prelude::*;

use crate::error::Result;
use crate::store::{BaselineStore, RevisionStore};

use super::PgStore;

#[async_trait]
impl BaselineStore for PgStore {
    async fn put_baseline(&self, baseline: &Baseline) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO baselines (device_id, baseline_type, payload, computed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (device_id, baseline_type) DO UPDATE SET
                payload = EXCLUDED.payload,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(baseline.device_id.to_uuid())
        .bind(&baseline.baseline_type)
        .bind(&baseline.payload)
        .bind(baseline.computed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_baseline(
        &self,
        device_id: DeviceId,
        baseline_type: &str,
    ) -> Result<Option<Baseline>> {
        let row = sqlx::query(
            "SELECT device_id, baseline_type, payload, computed_at FROM baselines WHERE device_id = $1 AND baseline_type = $2",
        )
        .bind(device_id.to_uuid())
        .bind(baseline_type)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(Baseline {
                device_id: DeviceId(row.try_get("device_id")?),
                baseline_type: row.try_get("baseline_type")?,
                payload: row.try_get("payload")?,
                computed_at: row.try_get("computed_at")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl RevisionStore for PgStore {
    async fn get_revision(&self) -> Result<i64> {
        let row = sqlx::query("SELECT revision FROM config_revision WHERE id = 1")
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("revision")?)
    }

    async fn increment_revision(&self) -> Result<i64> {
        let mut tx = self.pool().begin().await?;
        let revision = Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(revision)
    }
}
