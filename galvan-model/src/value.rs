use chrono::{DateTime, Utc};

/// Discriminant for the typed slot a tag declares and a point carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ValueType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    ByteArray,
    DateTime,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int8 => "int8",
            ValueType::Int16 => "int16",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::UInt8 => "uint8",
            ValueType::UInt16 => "uint16",
            ValueType::UInt32 => "uint32",
            ValueType::UInt64 => "uint64",
            ValueType::Float32 => "float32",
            ValueType::Float64 => "float64",
            ValueType::String => "string",
            ValueType::ByteArray => "byte_array",
            ValueType::DateTime => "date_time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bool" => Some(ValueType::Bool),
            "int8" => Some(ValueType::Int8),
            "int16" => Some(ValueType::Int16),
            "int32" => Some(ValueType::Int32),
            "int64" => Some(ValueType::Int64),
            "uint8" => Some(ValueType::UInt8),
            "uint16" => Some(ValueType::UInt16),
            "uint32" => Some(ValueType::UInt32),
            "uint64" => Some(ValueType::UInt64),
            "float32" => Some(ValueType::Float32),
            "float64" => Some(ValueType::Float64),
            "string" => Some(ValueType::String),
            "byte_array" => Some(ValueType::ByteArray),
            "date_time" => Some(ValueType::DateTime),
            _ => None,
        }
    }

    /// Whether values of this type can be coerced to a float for rule
    /// evaluation.
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            ValueType::String | ValueType::ByteArray | ValueType::DateTime
        )
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed tag reading. Exactly one variant is populated per point; the
/// variant must agree with the owning tag's declared [`ValueType`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "value", rename_all = "snake_case"))]
pub enum TelemetryValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    ByteArray(Vec<u8>),
    DateTime(DateTime<Utc>),
}

impl TelemetryValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TelemetryValue::Bool(_) => ValueType::Bool,
            TelemetryValue::Int8(_) => ValueType::Int8,
            TelemetryValue::Int16(_) => ValueType::Int16,
            TelemetryValue::Int32(_) => ValueType::Int32,
            TelemetryValue::Int64(_) => ValueType::Int64,
            TelemetryValue::UInt8(_) => ValueType::UInt8,
            TelemetryValue::UInt16(_) => ValueType::UInt16,
            TelemetryValue::UInt32(_) => ValueType::UInt32,
            TelemetryValue::UInt64(_) => ValueType::UInt64,
            TelemetryValue::Float32(_) => ValueType::Float32,
            TelemetryValue::Float64(_) => ValueType::Float64,
            TelemetryValue::String(_) => ValueType::String,
            TelemetryValue::ByteArray(_) => ValueType::ByteArray,
            TelemetryValue::DateTime(_) => ValueType::DateTime,
        }
    }

    /// Coerce to a float for threshold and condition evaluation.
    ///
    /// Bools coerce to 0/1. String, byte array, and timestamp values are
    /// non-numeric and return `None`; rules never fire on them.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            TelemetryValue::Int8(v) => Some(f64::from(*v)),
            TelemetryValue::Int16(v) => Some(f64::from(*v)),
            TelemetryValue::Int32(v) => Some(f64::from(*v)),
            TelemetryValue::Int64(v) => Some(*v as f64),
            TelemetryValue::UInt8(v) => Some(f64::from(*v)),
            TelemetryValue::UInt16(v) => Some(f64::from(*v)),
            TelemetryValue::UInt32(v) => Some(f64::from(*v)),
            TelemetryValue::UInt64(v) => Some(*v as f64),
            TelemetryValue::Float32(v) => Some(f64::from(*v)),
            TelemetryValue::Float64(v) => Some(*v),
            TelemetryValue::String(_)
            | TelemetryValue::ByteArray(_)
            | TelemetryValue::DateTime(_) => None,
        }
    }

    /// Render the value for human-facing messages.
    pub fn display_string(&self) -> String {
        match self {
            TelemetryValue::Bool(b) => b.to_string(),
            TelemetryValue::Int8(v) => v.to_string(),
            TelemetryValue::Int16(v) => v.to_string(),
            TelemetryValue::Int32(v) => v.to_string(),
            TelemetryValue::Int64(v) => v.to_string(),
            TelemetryValue::UInt8(v) => v.to_string(),
            TelemetryValue::UInt16(v) => v.to_string(),
            TelemetryValue::UInt32(v) => v.to_string(),
            TelemetryValue::UInt64(v) => v.to_string(),
            TelemetryValue::Float32(v) => v.to_string(),
            TelemetryValue::Float64(v) => v.to_string(),
            TelemetryValue::String(s) => s.clone(),
            TelemetryValue::ByteArray(b) => format!("<{} bytes>", b.len()),
            TelemetryValue::DateTime(dt) => dt.to_rfc3339(),
        }
    }
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        TelemetryValue::Float64(value)
    }
}

impl From<bool> for TelemetryValue {
    fn from(value: bool) -> Self {
        TelemetryValue::Bool(value)
    }
}

impl From<i64> for TelemetryValue {
    fn from(value: i64) -> Self {
        TelemetryValue::Int64(value)
    }
}

/// OPC-style quality byte attached to every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Quality(pub u8);

impl Quality {
    pub const GOOD: Quality = Quality(0xC0);
    pub const UNCERTAIN: Quality = Quality(0x40);
    pub const BAD: Quality = Quality(0x00);

    pub fn is_good(&self) -> bool {
        self.0 & 0xC0 == 0xC0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::GOOD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion_covers_numeric_variants() {
        assert_eq!(TelemetryValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(TelemetryValue::Int32(-7).as_f64(), Some(-7.0));
        assert_eq!(TelemetryValue::UInt64(42).as_f64(), Some(42.0));
        assert_eq!(TelemetryValue::Float32(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn non_numeric_variants_do_not_coerce() {
        assert_eq!(TelemetryValue::String("on".into()).as_f64(), None);
        assert_eq!(TelemetryValue::ByteArray(vec![1, 2]).as_f64(), None);
        assert_eq!(TelemetryValue::DateTime(Utc::now()).as_f64(), None);
    }

    #[test]
    fn value_type_round_trips_through_names() {
        for vt in [
            ValueType::Bool,
            ValueType::Int8,
            ValueType::UInt64,
            ValueType::Float64,
            ValueType::String,
            ValueType::ByteArray,
            ValueType::DateTime,
        ] {
            assert_eq!(ValueType::parse(vt.as_str()), Some(vt));
        }
    }

    #[test]
    fn quality_good_bit_mask() {
        assert!(Quality::GOOD.is_good());
        assert!(!Quality::BAD.is_good());
        assert!(!Quality::UNCERTAIN.is_good());
    }
}
