use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

use crate::ids::DeviceId;

/// Field protocol a device speaks.
///
/// Wire formats live behind the collector session capability; the protocol
/// here only selects which collector variant the supervisor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Protocol {
    OpcUa,
    LibPlcTag,
    Modbus,
    S7,
    Mqtt,
    /// Deterministic waveform generator, no external device required.
    Simulation,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpcUa => "opc_ua",
            Protocol::LibPlcTag => "lib_plc_tag",
            Protocol::Modbus => "modbus",
            Protocol::S7 => "s7",
            Protocol::Mqtt => "mqtt",
            Protocol::Simulation => "simulation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opc_ua" => Some(Protocol::OpcUa),
            "lib_plc_tag" => Some(Protocol::LibPlcTag),
            "modbus" => Some(Protocol::Modbus),
            "s7" => Some(Protocol::S7),
            "mqtt" => Some(Protocol::Mqtt),
            "simulation" => Some(Protocol::Simulation),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source of tags, accessed by exactly one collector instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub connection_string: Option<String>,
    pub enabled: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Hash over the connection-affecting fields.
    ///
    /// The collector supervisor compares fingerprints across a config reload:
    /// a changed fingerprint means stop-then-restart, an unchanged one means
    /// tag changes can be applied in place.
    pub fn connection_fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.protocol.hash(&mut hasher);
        self.host.hash(&mut hasher);
        self.port.hash(&mut hasher);
        self.connection_string.hash(&mut hasher);
        self.enabled.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            id: DeviceId::new(),
            name: "press-01".into(),
            protocol: Protocol::LibPlcTag,
            host: "10.0.0.12".into(),
            port: 44818,
            connection_string: None,
            enabled: true,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_ignores_name_changes() {
        let a = device();
        let mut b = a.clone();
        b.name = "press-01-renamed".into();
        assert_eq!(a.connection_fingerprint(), b.connection_fingerprint());
    }

    #[test]
    fn fingerprint_tracks_connection_fields() {
        let a = device();
        let mut b = a.clone();
        b.host = "10.0.0.13".into();
        assert_ne!(a.connection_fingerprint(), b.connection_fingerprint());

        let mut c = a.clone();
        c.enabled = false;
        assert_ne!(a.connection_fingerprint(), c.connection_fingerprint());
    }
}
