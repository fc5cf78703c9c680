//! Minute/hour roll-ups and watermark-guarded retention.
//!
//! The 1m aggregator rolls raw samples into minute buckets and the 1h
//! aggregator rolls minute buckets into hour buckets; each advances its
//! watermark only after the batch is durably written. Retention prunes raw
//! rows only when they are both past the retention horizon and at or below
//! the minute watermark (and minute rows below the hour watermark), so data
//! is never lost to pruning ahead of aggregation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use galvan_config::AggregationConfig;

use crate::clock::Clock;
use crate::store::MaintenanceStore;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

#[derive(Debug)]
pub struct AggregationJob {
    store: Arc<dyn MaintenanceStore>,
    clock: Arc<dyn Clock>,
    config: AggregationConfig,
}

impl AggregationJob {
    pub fn new(
        store: Arc<dyn MaintenanceStore>,
        clock: Arc<dyn Clock>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// One minute-level cycle: roll up, then prune raw rows behind the
    /// watermark and past the raw retention horizon.
    pub async fn run_minute_cycle(&self) {
        let now = self.clock.now_ms();
        match self.store.run_minute_rollup(now).await {
            Ok(watermark) => debug!(watermark, "minute rollup done"),
            Err(e) => {
                error!(error = %e, "minute rollup failed");
                return;
            }
        }

        let cutoff = now - self.config.raw_retention_hours as i64 * HOUR_MS;
        match self.store.delete_telemetry_before(cutoff).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, cutoff, "pruned raw telemetry"),
            Err(e) => error!(error = %e, "raw retention failed"),
        }
    }

    /// One hour-level cycle: roll up, then prune minute rows behind the hour
    /// watermark and past the minute retention horizon.
    pub async fn run_hour_cycle(&self) {
        let now = self.clock.now_ms();
        match self.store.run_hour_rollup(now).await {
            Ok(watermark) => debug!(watermark, "hour rollup done"),
            Err(e) => {
                error!(error = %e, "hour rollup failed");
                return;
            }
        }

        let cutoff = now - self.config.minute_retention_days as i64 * DAY_MS;
        match self.store.delete_minute_before(cutoff).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, cutoff, "pruned minute aggregates"),
            Err(e) => error!(error = %e, "minute retention failed"),
        }
    }

    /// Spawn both periodic tasks.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> (JoinHandle<()>, JoinHandle<()>) {
        let minute = {
            let job = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(job.config.minute_interval_secs));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => job.run_minute_cycle().await,
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        };

        let hour = {
            let job = self;
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(job.config.hour_interval_secs));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => job.run_hour_cycle().await,
                        _ = cancel.cancelled() => break,
                    }
                }
            })
        };

        (minute, hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records calls; retention honors a fixed watermark like the SQL does.
    #[derive(Debug)]
    struct FakeMaintenanceStore {
        minute_watermark: i64,
        deletes: Mutex<Vec<i64>>,
        rollups: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl MaintenanceStore for FakeMaintenanceStore {
        async fn get_watermark(&self, _table: &str) -> Result<i64> {
            Ok(self.minute_watermark)
        }

        async fn set_watermark(&self, _table: &str, _ts_ms: i64) -> Result<()> {
            Ok(())
        }

        async fn run_minute_rollup(&self, horizon_ms: i64) -> Result<i64> {
            self.rollups.lock().unwrap().push(horizon_ms);
            Ok(self.minute_watermark)
        }

        async fn run_hour_rollup(&self, _horizon_ms: i64) -> Result<i64> {
            Ok(0)
        }

        async fn delete_telemetry_before(&self, cutoff_ms: i64) -> Result<u64> {
            // Guard applied in the store: nothing above the watermark goes.
            let effective = cutoff_ms.min(self.minute_watermark + 1);
            self.deletes.lock().unwrap().push(effective);
            Ok(0)
        }

        async fn delete_minute_before(&self, _cutoff_ms: i64) -> Result<u64> {
            Ok(0)
        }
    }

    /// Raw retention of zero must still never reach above the minute
    /// watermark.
    #[tokio::test]
    async fn retention_cutoff_never_passes_watermark() {
        let store = Arc::new(FakeMaintenanceStore {
            minute_watermark: 600_000,
            deletes: Mutex::new(Vec::new()),
            rollups: Mutex::new(Vec::new()),
        });
        let clock = ManualClock::new(1_000_000);
        let job = AggregationJob::new(
            Arc::clone(&store) as Arc<dyn MaintenanceStore>,
            clock,
            AggregationConfig {
                raw_retention_hours: 0,
                ..Default::default()
            },
        );

        job.run_minute_cycle().await;

        let deletes = store.deletes.lock().unwrap();
        assert_eq!(deletes.len(), 1);
        assert!(
            deletes[0] <= 600_001,
            "delete cutoff {} reached above the minute watermark",
            deletes[0]
        );
        assert_eq!(*store.rollups.lock().unwrap(), vec![1_000_000]);
    }
}
