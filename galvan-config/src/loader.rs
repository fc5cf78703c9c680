use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::models::{
    AggregationConfig, CaptureConfig, CollectorsConfig, Config, DatabaseConfig,
    DispatcherConfig, EnvConfig, FileConfig, OverflowConfig, PipelineConfig, RevisionConfig,
    ShutdownConfig,
};
use crate::util::{parse_bool_var, parse_var, string_var};

/// Merges configuration from a TOML file, `GALVAN_*` environment variables,
/// and hard defaults. Precedence: env > file > default.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<Config> {
        let file = match &self.file_path {
            Some(path) => Self::read_file(path)?,
            None => FileConfig::default(),
        };
        let env = Self::read_env();
        Ok(Self::resolve(file, env))
    }

    fn read_file(path: &Path) -> Result<FileConfig> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(parsed)
    }

    fn read_env() -> EnvConfig {
        EnvConfig {
            database_url: string_var("GALVAN_DATABASE_URL"),
            database_max_connections: parse_var("GALVAN_DATABASE_MAX_CONNECTIONS"),
            pipeline_capacity: parse_var("GALVAN_PIPELINE_CAPACITY"),
            pipeline_batch_size: parse_var("GALVAN_PIPELINE_BATCH_SIZE"),
            pipeline_batch_flush_ms: parse_var("GALVAN_PIPELINE_BATCH_FLUSH_MS"),
            sink_queue_capacity: parse_var("GALVAN_SINK_QUEUE_CAPACITY"),
            revision_poll_interval_ms: parse_var("GALVAN_REVISION_POLL_INTERVAL_MS"),
            shutdown_grace_secs: parse_var("GALVAN_SHUTDOWN_GRACE_SECS"),
            simulation: parse_bool_var("GALVAN_SIMULATION"),
            overflow_file: string_var("GALVAN_OVERFLOW_FILE").map(PathBuf::from),
        }
    }

    fn resolve(file: FileConfig, env: EnvConfig) -> Config {
        let pipeline_defaults = PipelineConfig::default();
        let dispatcher_defaults = DispatcherConfig::default();
        let collectors_defaults = CollectorsConfig::default();
        let aggregation_defaults = AggregationConfig::default();
        let capture_defaults = CaptureConfig::default();
        let revision_defaults = RevisionConfig::default();
        let shutdown_defaults = ShutdownConfig::default();

        Config {
            database: DatabaseConfig {
                url: env
                    .database_url
                    .or(file.database.url)
                    .unwrap_or_default(),
                max_connections: env
                    .database_max_connections
                    .or(file.database.max_connections)
                    .unwrap_or(10),
            },
            pipeline: PipelineConfig {
                capacity: env
                    .pipeline_capacity
                    .or(file.pipeline.capacity)
                    .unwrap_or(pipeline_defaults.capacity),
                batch_size: env
                    .pipeline_batch_size
                    .or(file.pipeline.batch_size)
                    .unwrap_or(pipeline_defaults.batch_size),
                batch_flush_ms: env
                    .pipeline_batch_flush_ms
                    .or(file.pipeline.batch_flush_ms)
                    .unwrap_or(pipeline_defaults.batch_flush_ms),
            },
            dispatcher: DispatcherConfig {
                sink_queue_capacity: env
                    .sink_queue_capacity
                    .or(file.dispatcher.sink_queue_capacity)
                    .unwrap_or(dispatcher_defaults.sink_queue_capacity),
            },
            collectors: CollectorsConfig {
                reconnect_initial_ms: file
                    .collectors
                    .reconnect_initial_ms
                    .unwrap_or(collectors_defaults.reconnect_initial_ms),
                reconnect_max_ms: file
                    .collectors
                    .reconnect_max_ms
                    .unwrap_or(collectors_defaults.reconnect_max_ms),
                default_scan_interval_ms: file
                    .collectors
                    .default_scan_interval_ms
                    .unwrap_or(collectors_defaults.default_scan_interval_ms),
                simulation: env
                    .simulation
                    .or(file.collectors.simulation)
                    .unwrap_or(collectors_defaults.simulation),
            },
            aggregation: AggregationConfig {
                minute_interval_secs: file
                    .aggregation
                    .minute_interval_secs
                    .unwrap_or(aggregation_defaults.minute_interval_secs),
                hour_interval_secs: file
                    .aggregation
                    .hour_interval_secs
                    .unwrap_or(aggregation_defaults.hour_interval_secs),
                raw_retention_hours: file
                    .aggregation
                    .raw_retention_hours
                    .unwrap_or(aggregation_defaults.raw_retention_hours),
                minute_retention_days: file
                    .aggregation
                    .minute_retention_days
                    .unwrap_or(aggregation_defaults.minute_retention_days),
            },
            capture: CaptureConfig {
                max_active_secs: file
                    .capture
                    .max_active_secs
                    .unwrap_or(capture_defaults.max_active_secs),
                ring_buffer_cap: file
                    .capture
                    .ring_buffer_cap
                    .unwrap_or(capture_defaults.ring_buffer_cap),
            },
            revision: RevisionConfig {
                poll_interval_ms: env
                    .revision_poll_interval_ms
                    .or(file.revision.poll_interval_ms)
                    .unwrap_or(revision_defaults.poll_interval_ms),
            },
            shutdown: ShutdownConfig {
                grace_secs: env
                    .shutdown_grace_secs
                    .or(file.shutdown.grace_secs)
                    .unwrap_or(shutdown_defaults.grace_secs),
            },
            overflow: OverflowConfig {
                file: env.overflow_file.or(file.overflow.file),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_file() {
        let config = ConfigLoader::resolve(FileConfig::default(), EnvConfig::default());
        assert_eq!(config.pipeline.capacity, 10_000);
        assert_eq!(config.pipeline.batch_size, 500);
        assert_eq!(config.pipeline.batch_flush_ms, 100);
        assert_eq!(config.revision.poll_interval_ms, 5_000);
        assert_eq!(config.shutdown.grace_secs, 10);
    }

    #[test]
    fn env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [pipeline]
            capacity = 2000
            "#,
        )
        .unwrap();
        let env = EnvConfig {
            pipeline_capacity: Some(64),
            ..Default::default()
        };
        let config = ConfigLoader::resolve(file, env);
        assert_eq!(config.pipeline.capacity, 64);
    }

    #[test]
    fn file_sections_parse() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
            [database]
            url = "postgresql://localhost/galvan"

            [pipeline]
            capacity = 4096
            batch_size = 128

            [collectors]
            simulation = true

            [aggregation]
            raw_retention_hours = 24
            "#
        )
        .unwrap();
        let config = ConfigLoader::new().with_file(f.path()).load().unwrap();
        assert_eq!(config.database.url, "postgresql://localhost/galvan");
        assert_eq!(config.pipeline.capacity, 4096);
        assert_eq!(config.pipeline.batch_size, 128);
        assert!(config.collectors.simulation);
        assert_eq!(config.aggregation.raw_retention_hours, 24);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_catches_inverted_batch_size() {
        let mut config = ConfigLoader::resolve(FileConfig::default(), EnvConfig::default());
        config.database.url = "postgresql://localhost/galvan".into();
        config.pipeline.batch_size = config.pipeline.capacity + 1;
        assert!(config.validate().is_err());
    }
}
