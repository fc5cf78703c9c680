//! Shared configuration library for Galvan.
//!
//! Centralizes config loading and validation for the server binary and the
//! integration tests: a TOML file provides the base, `GALVAN_*` environment
//! variables override it, and hard defaults fill the rest. Downstream crates
//! only see the resolved [`Config`]; the file/env split stays in here.

pub mod error;
pub mod loader;
pub mod models;
pub mod util;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use models::{
    AggregationConfig, CaptureConfig, CollectorsConfig, Config, DatabaseConfig,
    DispatcherConfig, OverflowConfig, PipelineConfig, RevisionConfig, ShutdownConfig,
};
