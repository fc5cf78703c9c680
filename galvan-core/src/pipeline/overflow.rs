use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

use galvan_model::TelemetryPoint;

/// Sink of last resort for samples the pipeline or a sink queue had to drop.
///
/// Best-effort and non-blocking: implementations must never raise into the
/// caller and must not await.
pub trait OverflowExporter: Send + Sync + std::fmt::Debug {
    fn export(&self, points: &[TelemetryPoint]);
}

/// Logs dropped samples at warn level, one line per batch.
#[derive(Debug, Default)]
pub struct LogOverflowExporter;

impl OverflowExporter for LogOverflowExporter {
    fn export(&self, points: &[TelemetryPoint]) {
        if points.is_empty() {
            return;
        }
        let first = &points[0];
        warn!(
            count = points.len(),
            device_id = %first.device_id,
            tag_id = %first.tag_id,
            first_ts = first.ts_ms,
            "dropped telemetry handed to overflow exporter"
        );
    }
}

/// Appends dropped samples to a JSON-lines file for later inspection or
/// replay. Write failures are logged and swallowed.
#[derive(Debug)]
pub struct JsonlOverflowExporter {
    file: Mutex<File>,
}

impl JsonlOverflowExporter {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl OverflowExporter for JsonlOverflowExporter {
    fn export(&self, points: &[TelemetryPoint]) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        for point in points {
            match serde_json::to_string(point) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(error = %e, "failed to append to overflow file");
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode overflow sample"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records exported points for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingExporter {
        pub points: Arc<Mutex<Vec<TelemetryPoint>>>,
    }

    impl OverflowExporter for RecordingExporter {
        fn export(&self, points: &[TelemetryPoint]) {
            self.points
                .lock()
                .unwrap()
                .extend(points.iter().cloned());
        }
    }
}
