use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{QueryBuilder, Row};

use galvan_model::prelude::*;

use crate::error::{CoreError, Result};
use crate::store::CollectionStore;

use super::PgStore;

fn collection_rule_from_row(row: &PgRow) -> Result<CollectionRule> {
    let start_raw: serde_json::Value = row.try_get("start_condition")?;
    let stop_raw: serde_json::Value = row.try_get("stop_condition")?;
    let config_raw: serde_json::Value = row.try_get("config")?;
    Ok(CollectionRule {
        id: RuleId(row.try_get("id")?),
        device_id: DeviceId(row.try_get("device_id")?),
        enabled: row.try_get("enabled")?,
        start_condition: RuleCondition::from_json(&start_raw)
            .map_err(|e| CoreError::Internal(format!("Undecodable start condition: {e}")))?,
        stop_condition: RuleCondition::from_json(&stop_raw)
            .map_err(|e| CoreError::Internal(format!("Undecodable stop condition: {e}")))?,
        config: serde_json::from_value(config_raw)
            .map_err(|e| CoreError::Internal(format!("Undecodable collection config: {e}")))?,
        trigger_count: row.try_get("trigger_count")?,
        last_trigger_at: row.try_get("last_trigger_at")?,
    })
}

fn segment_from_row(row: &PgRow) -> Result<CollectionSegment> {
    let status_raw: String = row.try_get("status")?;
    let status = SegmentStatus::parse(&status_raw)
        .ok_or_else(|| CoreError::Internal(format!("Unknown segment status: {status_raw}")))?;
    Ok(CollectionSegment {
        id: SegmentId(row.try_get("id")?),
        rule_id: RuleId(row.try_get("rule_id")?),
        device_id: DeviceId(row.try_get("device_id")?),
        start_ts_ms: row.try_get("start_ts")?,
        end_ts_ms: row.try_get("end_ts")?,
        status,
    })
}

const COLLECTION_RULE_COLUMNS: &str =
    "id, device_id, enabled, start_condition, stop_condition, config, trigger_count, last_trigger_at";
const SEGMENT_COLUMNS: &str = "id, rule_id, device_id, start_ts, end_ts, status";

impl PgStore {
    async fn require_device(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        device_id: DeviceId,
    ) -> Result<()> {
        let exists: bool = sqlx::query("SELECT EXISTS(SELECT 1 FROM devices WHERE id = $1) AS e")
            .bind(device_id.to_uuid())
            .fetch_one(&mut **tx)
            .await?
            .try_get("e")?;
        if !exists {
            return Err(CoreError::Validation(format!(
                "collection rule references unknown device {device_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionStore for PgStore {
    async fn create_collection_rule(&self, rule: &CollectionRule) -> Result<()> {
        rule.validate().map_err(|e| CoreError::Validation(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        Self::require_device(&mut tx, rule.device_id).await?;
        sqlx::query(
            r#"
            INSERT INTO collection_rules (id, device_id, enabled, start_condition, stop_condition, config, trigger_count, last_trigger_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(rule.id.to_uuid())
        .bind(rule.device_id.to_uuid())
        .bind(rule.enabled)
        .bind(rule.start_condition.to_json()?)
        .bind(rule.stop_condition.to_json()?)
        .bind(serde_json::to_value(&rule.config)?)
        .bind(rule.trigger_count)
        .bind(rule.last_trigger_at)
        .execute(&mut *tx)
        .await?;
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_collection_rule(&self, rule: &CollectionRule) -> Result<()> {
        rule.validate().map_err(|e| CoreError::Validation(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        Self::require_device(&mut tx, rule.device_id).await?;
        let result = sqlx::query(
            r#"
            UPDATE collection_rules
            SET device_id = $2, enabled = $3, start_condition = $4, stop_condition = $5, config = $6
            WHERE id = $1
            "#,
        )
        .bind(rule.id.to_uuid())
        .bind(rule.device_id.to_uuid())
        .bind(rule.enabled)
        .bind(rule.start_condition.to_json()?)
        .bind(rule.stop_condition.to_json()?)
        .bind(serde_json::to_value(&rule.config)?)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("collection rule {}", rule.id)));
        }
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_collection_rule(&self, id: RuleId) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("DELETE FROM collection_rules WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("collection rule {id}")));
        }
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_enabled_collection_rules(&self) -> Result<Vec<CollectionRule>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLLECTION_RULE_COLUMNS} FROM collection_rules WHERE enabled"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(collection_rule_from_row).collect()
    }

    async fn record_trigger(&self, id: RuleId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE collection_rules SET trigger_count = trigger_count + 1, last_trigger_at = $2 WHERE id = $1",
        )
        .bind(id.to_uuid())
        .bind(at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn insert_segment(&self, segment: &CollectionSegment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_segments (id, rule_id, device_id, start_ts, end_ts, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(segment.id.to_uuid())
        .bind(segment.rule_id.to_uuid())
        .bind(segment.device_id.to_uuid())
        .bind(segment.start_ts_ms)
        .bind(segment.end_ts_ms)
        .bind(segment.status.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn append_segment_samples(
        &self,
        segment_id: SegmentId,
        points: &[TelemetryPoint],
    ) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;

        let status: String = sqlx::query("SELECT status FROM collection_segments WHERE id = $1")
            .bind(segment_id.to_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("segment {segment_id}")))?
            .try_get("status")?;
        if status != SegmentStatus::Active.as_str() {
            return Err(CoreError::LogicViolation(format!(
                "segment {segment_id} is {status}; its sample set is immutable"
            )));
        }

        let mut builder = QueryBuilder::new(
            "INSERT INTO segment_samples (segment_id, device_id, tag_id, ts, seq, value, value_num, quality, unit) ",
        );
        let rows: Vec<_> = points
            .iter()
            .map(|p| Self::value_columns(p).map(|cols| (p, cols)))
            .collect::<Result<_>>()?;
        builder.push_values(rows.iter(), |mut b, (p, (json, num))| {
            b.push_bind(segment_id.to_uuid())
                .push_bind(p.device_id.to_uuid())
                .push_bind(p.tag_id.as_str().to_owned())
                .push_bind(p.ts_ms)
                .push_bind(p.seq as i64)
                .push_bind(json.clone())
                .push_bind(*num)
                .push_bind(p.quality.0 as i16)
                .push_bind(p.unit.clone());
        });
        builder.push(" ON CONFLICT DO NOTHING");
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finalize_segment(
        &self,
        segment_id: SegmentId,
        end_ts_ms: i64,
        status: SegmentStatus,
    ) -> Result<()> {
        if status == SegmentStatus::Active {
            return Err(CoreError::Validation(
                "finalize requires a terminal status".to_string(),
            ));
        }
        let result = sqlx::query(
            "UPDATE collection_segments SET end_ts = $2, status = $3 WHERE id = $1 AND status = 'active'",
        )
        .bind(segment_id.to_uuid())
        .bind(end_ts_ms)
        .bind(status.as_str())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::LogicViolation(format!(
                "segment {segment_id} is not active"
            )));
        }
        Ok(())
    }

    async fn get_segment(&self, id: SegmentId) -> Result<Option<CollectionSegment>> {
        let row = sqlx::query(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM collection_segments WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(segment_from_row).transpose()
    }
}
