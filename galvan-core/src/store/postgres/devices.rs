use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

use galvan_model::prelude::*;

use crate::error::{CoreError, Result};
use crate::store::{DeviceStore, TagStore};

use super::PgStore;

fn metadata_from_row(row: &PgRow) -> Result<BTreeMap<String, String>> {
    let raw: serde_json::Value = row.try_get("metadata")?;
    Ok(serde_json::from_value(raw)?)
}

fn device_from_row(row: &PgRow) -> Result<Device> {
    let protocol_raw: String = row.try_get("protocol")?;
    let protocol = Protocol::parse(&protocol_raw)
        .ok_or_else(|| CoreError::Internal(format!("Unknown protocol: {protocol_raw}")))?;
    Ok(Device {
        id: DeviceId(row.try_get("id")?),
        name: row.try_get("name")?,
        protocol,
        host: row.try_get("host")?,
        port: row.try_get::<i32, _>("port")? as u16,
        connection_string: row.try_get("connection_string")?,
        enabled: row.try_get("enabled")?,
        metadata: metadata_from_row(row)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tag_from_row(row: &PgRow) -> Result<Tag> {
    let data_type_raw: String = row.try_get("data_type")?;
    let data_type = ValueType::parse(&data_type_raw)
        .ok_or_else(|| CoreError::Internal(format!("Unknown data type: {data_type_raw}")))?;
    Ok(Tag {
        id: TagId(row.try_get("id")?),
        device_id: DeviceId(row.try_get("device_id")?),
        name: row.try_get("name")?,
        data_type,
        enabled: row.try_get("enabled")?,
        address: row.try_get("address")?,
        scan_interval_ms: row.try_get::<i64, _>("scan_interval_ms")? as u64,
        tag_group: row.try_get("tag_group")?,
        metadata: metadata_from_row(row)?,
    })
}

const DEVICE_COLUMNS: &str = "id, name, protocol, host, port, connection_string, enabled, metadata, created_at, updated_at";
const TAG_COLUMNS: &str =
    "id, device_id, name, data_type, enabled, address, scan_interval_ms, tag_group, metadata";

#[async_trait]
impl DeviceStore for PgStore {
    async fn create_device(&self, device: &Device) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO devices (id, name, protocol, host, port, connection_string, enabled, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(device.id.to_uuid())
        .bind(&device.name)
        .bind(device.protocol.as_str())
        .bind(&device.host)
        .bind(device.port as i32)
        .bind(&device.connection_string)
        .bind(device.enabled)
        .bind(serde_json::to_value(&device.metadata)?)
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_device(&self, device: &Device) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET name = $2, protocol = $3, host = $4, port = $5,
                connection_string = $6, enabled = $7, metadata = $8, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(device.id.to_uuid())
        .bind(&device.name)
        .bind(device.protocol.as_str())
        .bind(&device.host)
        .bind(device.port as i32)
        .bind(&device.connection_string)
        .bind(device.enabled)
        .bind(serde_json::to_value(&device.metadata)?)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("device {}", device.id)));
        }
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let referenced: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM collection_rules WHERE device_id = $1",
        )
        .bind(id.to_uuid())
        .fetch_one(&mut *tx)
        .await?
        .try_get("n")?;
        if referenced > 0 {
            return Err(CoreError::Validation(format!(
                "device {id} is still referenced by {referenced} collection rule(s)"
            )));
        }

        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("device {id}")));
        }
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>> {
        let row = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY name"))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn list_enabled_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE enabled ORDER BY name"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(device_from_row).collect()
    }
}

#[async_trait]
impl TagStore for PgStore {
    async fn upsert_tag(&self, tag: &Tag) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO tags (id, device_id, name, data_type, enabled, address, scan_interval_ms, tag_group, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (device_id, id) DO UPDATE SET
                name = EXCLUDED.name,
                data_type = EXCLUDED.data_type,
                enabled = EXCLUDED.enabled,
                address = EXCLUDED.address,
                scan_interval_ms = EXCLUDED.scan_interval_ms,
                tag_group = EXCLUDED.tag_group,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(tag.id.as_str())
        .bind(tag.device_id.to_uuid())
        .bind(&tag.name)
        .bind(tag.data_type.as_str())
        .bind(tag.enabled)
        .bind(&tag.address)
        .bind(tag.scan_interval_ms as i64)
        .bind(&tag.tag_group)
        .bind(serde_json::to_value(&tag.metadata)?)
        .execute(&mut *tx)
        .await?;
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_tag(&self, device_id: DeviceId, id: &TagId) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("DELETE FROM tags WHERE device_id = $1 AND id = $2")
            .bind(device_id.to_uuid())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("tag {id} on device {device_id}")));
        }
        Self::bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_tags(&self, device_id: DeviceId) -> Result<Vec<Tag>> {
        let rows = sqlx::query(&format!(
            "SELECT {TAG_COLUMNS} FROM tags WHERE device_id = $1 ORDER BY id"
        ))
        .bind(device_id.to_uuid())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(tag_from_row).collect()
    }

    async fn list_enabled_tags(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query(&format!(
            "SELECT {TAG_COLUMNS} FROM tags WHERE enabled ORDER BY device_id, id"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(tag_from_row).collect()
    }
}
