//! Configuration revision watcher.
//!
//! The API boundary's only obligation to the core is to call
//! `RevisionStore::increment_revision` after every config write; this watcher
//! polls the counter and drives hot reload without any in-process signaling
//! from the write paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::store::RevisionStore;

/// A component reloaded on revision change. Callbacks must be idempotent;
/// a failing listener does not stop the others.
#[async_trait]
pub trait RevisionListener: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    async fn on_changed(&self, revision: i64) -> Result<()>;
}

#[derive(Debug)]
pub struct ConfigRevisionWatcher {
    store: Arc<dyn RevisionStore>,
    listeners: Vec<Arc<dyn RevisionListener>>,
    poll_interval: Duration,
    baseline: i64,
}

impl ConfigRevisionWatcher {
    /// `baseline` is the revision the host observed while wiring components;
    /// anything newer triggers a reload on the first poll.
    pub fn new(store: Arc<dyn RevisionStore>, poll_interval: Duration, baseline: i64) -> Self {
        Self {
            store,
            listeners: Vec::new(),
            poll_interval,
            baseline,
        }
    }

    /// Listeners run in registration order on every observed change.
    pub fn register(&mut self, listener: Arc<dyn RevisionListener>) -> &mut Self {
        self.listeners.push(listener);
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            listeners = self.listeners.len(),
            "config revision watcher started"
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_seen = self.baseline;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let revision = match self.store.get_revision().await {
                Ok(revision) => revision,
                Err(e) => {
                    error!(error = %e, "failed to read config revision");
                    continue;
                }
            };
            if revision <= last_seen {
                continue;
            }

            info!(from = last_seen, to = revision, "config revision changed, reloading");
            for listener in &self.listeners {
                if let Err(e) = listener.on_changed(revision).await {
                    error!(listener = listener.name(), error = %e, "reload callback failed");
                }
            }
            last_seen = revision;
            debug!(revision, "reload callbacks finished");
        }

        info!("config revision watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug, Default)]
    struct FakeRevisionStore {
        revision: AtomicI64,
    }

    #[async_trait]
    impl RevisionStore for FakeRevisionStore {
        async fn get_revision(&self) -> Result<i64> {
            Ok(self.revision.load(Ordering::SeqCst))
        }

        async fn increment_revision(&self) -> Result<i64> {
            Ok(self.revision.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[derive(Debug)]
    struct RecordingListener {
        name: &'static str,
        calls: Arc<Mutex<Vec<(&'static str, i64)>>>,
        fail: bool,
    }

    #[async_trait]
    impl RevisionListener for RecordingListener {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_changed(&self, revision: i64) -> Result<()> {
            self.calls.lock().unwrap().push((self.name, revision));
            if self.fail {
                Err(crate::error::CoreError::Internal("listener fault".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_listeners_in_order_and_survives_failures() {
        let store = Arc::new(FakeRevisionStore::default());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = ConfigRevisionWatcher::new(
            Arc::clone(&store) as Arc<dyn RevisionStore>,
            Duration::from_millis(50),
            0,
        );
        watcher
            .register(Arc::new(RecordingListener {
                name: "collectors",
                calls: Arc::clone(&calls),
                fail: true,
            }))
            .register(Arc::new(RecordingListener {
                name: "alarms",
                calls: Arc::clone(&calls),
                fail: false,
            }))
            .register(Arc::new(RecordingListener {
                name: "capture",
                calls: Arc::clone(&calls),
                fail: false,
            }));

        let cancel = CancellationToken::new();
        let task = watcher.spawn(cancel.clone());

        store.increment_revision().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        cancel.cancel();
        task.await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![("collectors", 1), ("alarms", 1), ("capture", 1)],
            "all listeners fire once, in registration order, despite the first failing"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_revision_does_not_fire() {
        let store = Arc::new(FakeRevisionStore::default());
        store.revision.store(5, Ordering::SeqCst);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = ConfigRevisionWatcher::new(
            Arc::clone(&store) as Arc<dyn RevisionStore>,
            Duration::from_millis(50),
            5,
        );
        watcher.register(Arc::new(RecordingListener {
            name: "collectors",
            calls: Arc::clone(&calls),
            fail: false,
        }));

        let cancel = CancellationToken::new();
        let task = watcher.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
    }
}
