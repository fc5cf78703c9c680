use chrono::{DateTime, Utc};

use crate::ids::DeviceId;

/// Per-device statistical baseline stored as an opaque JSON payload.
///
/// The payload describes either per-tag statistics or a fitted model; the
/// core only stores and retrieves it keyed by `(device_id, baseline_type)`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Baseline {
    pub device_id: DeviceId,
    pub baseline_type: String,
    pub payload: serde_json::Value,
    pub computed_at: DateTime<Utc>,
}
