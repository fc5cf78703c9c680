//! Core library for the Galvan telemetry platform.
//!
//! The real-time path: collectors acquire timestamped tag samples and write
//! them into a bounded [`pipeline`], whose batch writer persists them through
//! the [`store`] ports and fans them out via the [`dispatch`] layer to the
//! live broadcast hub, the [`alarm`] engine, and the [`capture`]
//! (collection-rule) engine. The [`revision`] watcher hot-reloads collectors
//! and rule sets when durable configuration changes, and [`jobs`] roll raw
//! samples into minute/hour aggregates with watermark-guarded retention.

pub mod alarm;
pub mod capture;
pub mod clock;
pub mod collect;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod revision;
pub mod store;

pub use alarm::AlarmEngine;
pub use capture::CaptureEngine;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use jobs::AggregationJob;
pub use pipeline::{TelemetryPipeline, WriteOutcome};
pub use revision::{ConfigRevisionWatcher, RevisionListener};
pub use store::postgres::PgStore;
