use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Raw configuration as defined in a TOML file. Every field is optional so a
/// partial file merges cleanly with env overrides and defaults.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub pipeline: FilePipelineConfig,
    #[serde(default)]
    pub dispatcher: FileDispatcherConfig,
    #[serde(default)]
    pub collectors: FileCollectorsConfig,
    #[serde(default)]
    pub aggregation: FileAggregationConfig,
    #[serde(default)]
    pub capture: FileCaptureConfig,
    #[serde(default)]
    pub revision: FileRevisionConfig,
    #[serde(default)]
    pub shutdown: FileShutdownConfig,
    #[serde(default)]
    pub overflow: FileOverflowConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePipelineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_flush_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDispatcherConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCollectorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_initial_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_scan_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAggregationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_retention_hours: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute_retention_days: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCaptureConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring_buffer_cap: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRevisionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileShutdownConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileOverflowConfig {
    /// When set, dropped samples are appended to this JSON-lines file
    /// instead of only being logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Environment-derived configuration values (`GALVAN_*`).
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub pipeline_capacity: Option<usize>,
    pub pipeline_batch_size: Option<usize>,
    pub pipeline_batch_flush_ms: Option<u64>,
    pub sink_queue_capacity: Option<usize>,
    pub revision_poll_interval_ms: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub simulation: Option<bool>,
    pub overflow_file: Option<PathBuf>,
}

/// Fully resolved configuration used by the server and core.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub dispatcher: DispatcherConfig,
    pub collectors: CollectorsConfig,
    pub aggregation: AggregationConfig,
    pub capture: CaptureConfig,
    pub revision: RevisionConfig,
    pub shutdown: ShutdownConfig,
    pub overflow: OverflowConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub batch_flush_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 500,
            batch_flush_ms: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub sink_queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sink_queue_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorsConfig {
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub default_scan_interval_ms: u64,
    /// Force every device onto the simulation session regardless of protocol.
    pub simulation: bool,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            default_scan_interval_ms: 1_000,
            simulation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    pub minute_interval_secs: u64,
    pub hour_interval_secs: u64,
    pub raw_retention_hours: u64,
    pub minute_retention_days: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            minute_interval_secs: 60,
            hour_interval_secs: 3_600,
            raw_retention_hours: 72,
            minute_retention_days: 90,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Hard ceiling on a Collecting/PostBuffer state before the segment is
    /// aborted.
    pub max_active_secs: u64,
    pub ring_buffer_cap: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_active_secs: 3_600,
            ring_buffer_cap: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RevisionConfig {
    pub poll_interval_ms: u64,
}

impl Default for RevisionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OverflowConfig {
    pub file: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Invalid(
                "database.url is required (or set GALVAN_DATABASE_URL)".to_string(),
            ));
        }
        if self.pipeline.capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.capacity must be > 0".to_string(),
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.batch_size must be > 0".to_string(),
            ));
        }
        if self.pipeline.batch_size > self.pipeline.capacity {
            return Err(ConfigError::Invalid(
                "pipeline.batch_size must not exceed pipeline.capacity".to_string(),
            ));
        }
        if self.dispatcher.sink_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.sink_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.collectors.reconnect_initial_ms == 0
            || self.collectors.reconnect_max_ms < self.collectors.reconnect_initial_ms
        {
            return Err(ConfigError::Invalid(
                "collectors reconnect backoff window is inverted".to_string(),
            ));
        }
        Ok(())
    }
}
