use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

use galvan_model::prelude::*;

use crate::error::{CoreError, Result};
use crate::store::AlarmStore;

use super::PgStore;

fn rule_from_row(row: &PgRow) -> Result<AlarmRule> {
    let condition_raw: String = row.try_get("condition")?;
    let condition = AlarmCondition::parse(&condition_raw)
        .ok_or_else(|| CoreError::Internal(format!("Unknown alarm condition: {condition_raw}")))?;
    Ok(AlarmRule {
        id: RuleId(row.try_get("id")?),
        tag_id: TagId(row.try_get("tag_id")?),
        device_id: row.try_get::<Option<uuid::Uuid>, _>("device_id")?.map(DeviceId),
        condition,
        threshold: row.try_get("threshold")?,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        severity: row.try_get("severity")?,
        message_template: row.try_get("message_template")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn alarm_from_row(row: &PgRow) -> Result<AlarmRecord> {
    let status_raw: i16 = row.try_get("status")?;
    let status = AlarmStatus::from_i16(status_raw)
        .ok_or_else(|| CoreError::Internal(format!("Unknown alarm status: {status_raw}")))?;
    Ok(AlarmRecord {
        id: AlarmId(row.try_get("id")?),
        device_id: DeviceId(row.try_get("device_id")?),
        tag_id: row.try_get::<Option<String>, _>("tag_id")?.map(TagId),
        ts_ms: row.try_get("ts")?,
        severity: row.try_get("severity")?,
        code: RuleId(row.try_get("code")?),
        message: row.try_get("message")?,
        status,
        acked_by: row.try_get("acked_by")?,
        acked_at: row.try_get("acked_at")?,
        ack_note: row.try_get("ack_note")?,
    })
}

const RULE_COLUMNS: &str = "id, tag_id, device_id, condition, threshold, duration_ms, severity, message_template, enabled, created_at, updated_at";
const ALARM_COLUMNS: &str =
    "id, device_id, tag_id, ts, severity, code, message, status, acked_by, acked_at, ack_note";

#[async_trait]
impl AlarmStore for PgStore {
    async fn create_alarm_rule(&self, rule: &AlarmRule) -> Result<()> {
        rule.validate().map_err(|e| CoreError::Validation(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO alarm_rules (id, tag_id, device_id, condition, threshold, duration_ms, severity, message_template, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(rule.id.to_uuid())
        .bind(rule.tag_id.as_str())
        .bind(rule.device_id.map(|d| d.to_uuid()))
        .bind(rule.condition.as_str())
        .bind(rule.threshold)
        .bind(rule.duration_ms as i64)
        .bind(rule.severity)
        .bind(&rule.message_template)
        .bind(rule.enabled)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_alarm_rule(&self, rule: &AlarmRule) -> Result<()> {
        rule.validate().map_err(|e| CoreError::Validation(e.to_string()))?;
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE alarm_rules
            SET tag_id = $2, device_id = $3, condition = $4, threshold = $5,
                duration_ms = $6, severity = $7, message_template = $8, enabled = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(rule.id.to_uuid())
        .bind(rule.tag_id.as_str())
        .bind(rule.device_id.map(|d| d.to_uuid()))
        .bind(rule.condition.as_str())
        .bind(rule.threshold)
        .bind(rule.duration_ms as i64)
        .bind(rule.severity)
        .bind(&rule.message_template)
        .bind(rule.enabled)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("alarm rule {}", rule.id)));
        }
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_alarm_rule(&self, id: RuleId) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("DELETE FROM alarm_rules WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("alarm rule {id}")));
        }
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_enabled_alarm_rules(&self) -> Result<Vec<AlarmRule>> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM alarm_rules WHERE enabled ORDER BY created_at"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn insert_alarm(&self, alarm: &AlarmRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alarms (id, device_id, tag_id, ts, severity, code, message, status, acked_by, acked_at, ack_note)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(alarm.id.to_uuid())
        .bind(alarm.device_id.to_uuid())
        .bind(alarm.tag_id.as_ref().map(|t| t.as_str().to_owned()))
        .bind(alarm.ts_ms)
        .bind(alarm.severity)
        .bind(alarm.code.to_uuid())
        .bind(&alarm.message)
        .bind(alarm.status.as_i16())
        .bind(&alarm.acked_by)
        .bind(alarm.acked_at)
        .bind(&alarm.ack_note)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_alarm(&self, id: AlarmId) -> Result<Option<AlarmRecord>> {
        let row = sqlx::query(&format!("SELECT {ALARM_COLUMNS} FROM alarms WHERE id = $1"))
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(alarm_from_row).transpose()
    }

    async fn list_open_alarms(&self, device_id: Option<DeviceId>) -> Result<Vec<AlarmRecord>> {
        let rows = match device_id {
            Some(device_id) => {
                sqlx::query(&format!(
                    "SELECT {ALARM_COLUMNS} FROM alarms WHERE status = 0 AND device_id = $1 ORDER BY ts DESC"
                ))
                .bind(device_id.to_uuid())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {ALARM_COLUMNS} FROM alarms WHERE status = 0 ORDER BY ts DESC"
                ))
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.iter().map(alarm_from_row).collect()
    }

    async fn acknowledge_alarm(
        &self,
        id: AlarmId,
        acked_by: &str,
        note: Option<&str>,
    ) -> Result<AlarmRecord> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("alarm {id}")))?;

        let alarm = alarm_from_row(&row)?;
        if !alarm.status.can_acknowledge() {
            return Err(CoreError::LogicViolation(format!(
                "alarm {id} is {:?} and cannot be acknowledged",
                alarm.status
            )));
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE alarms
            SET status = $2, acked_by = $3, acked_at = NOW(), ack_note = $4
            WHERE id = $1
            RETURNING {ALARM_COLUMNS}
            "#
        ))
        .bind(id.to_uuid())
        .bind(AlarmStatus::Acknowledged.as_i16())
        .bind(acked_by)
        .bind(note)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        alarm_from_row(&row)
    }

    async fn close_alarm(&self, id: AlarmId) -> Result<AlarmRecord> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("alarm {id}")))?;

        let alarm = alarm_from_row(&row)?;
        if !alarm.status.can_close() {
            return Err(CoreError::LogicViolation(format!(
                "alarm {id} is already closed"
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE alarms SET status = $2 WHERE id = $1 RETURNING {ALARM_COLUMNS}"
        ))
        .bind(id.to_uuid())
        .bind(AlarmStatus::Closed.as_i16())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        alarm_from_row(&row)
    }
}
