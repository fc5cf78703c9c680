use std::collections::BTreeMap;

use crate::ids::{DeviceId, TagId};
use crate::value::ValueType;

/// The logical name for one measurable quantity on one device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tag {
    pub id: TagId,
    pub device_id: DeviceId,
    pub name: String,
    pub data_type: ValueType,
    /// A disabled tag must not produce samples.
    pub enabled: bool,
    /// Protocol-specific address (register, node id, symbolic name).
    pub address: String,
    pub scan_interval_ms: u64,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub tag_group: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: BTreeMap<String, String>,
}

impl Tag {
    pub fn new(
        device_id: DeviceId,
        id: impl Into<TagId>,
        data_type: ValueType,
        address: impl Into<String>,
        scan_interval_ms: u64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            device_id,
            data_type,
            enabled: true,
            address: address.into(),
            scan_interval_ms,
            tag_group: None,
            metadata: BTreeMap::new(),
        }
    }
}
