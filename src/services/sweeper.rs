//! Periodic expiry sweep.
//!
//! The sweeper sleeps for a fixed interval, then reaps every expired record,
//! and repeats until its cancellation token fires. Per-record failures are
//! logged and counted; nothing a sweep encounters stops the loop.

use crate::services::blob_store::{BlobStore, ReapReport};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TRACING_TARGET: &str = "ephemeral_share::sweeper";

pub struct Sweeper {
    store: BlobStore,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl Sweeper {
    pub fn new(store: BlobStore, interval: Duration, cancel_token: CancellationToken) -> Self {
        Self {
            store,
            interval,
            cancel_token,
        }
    }

    /// Spawns the sweep loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Sleep-then-sweep loop. Fixed delay between the end of one sweep and the
    /// start of the next.
    async fn run(self) {
        tracing::info!(
            target: TRACING_TARGET,
            interval_secs = self.interval.as_secs(),
            "Expiry sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    tracing::info!(target: TRACING_TARGET, "Shutdown requested, stopping sweeper");
                    break;
                }

                () = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// Run a single reaping pass against the store's current time.
    pub async fn sweep_once(&self) -> ReapReport {
        let now = self.store.now();
        tracing::debug!(target: TRACING_TARGET, now = %now, "Sweeping expired uploads");

        let report = self.store.reap(now).await;
        if report.errors > 0 {
            tracing::warn!(
                target: TRACING_TARGET,
                removed = report.removed,
                errors = report.errors,
                "Sweep completed with errors"
            );
        } else if report.removed > 0 {
            tracing::info!(
                target: TRACING_TARGET,
                removed = report.removed,
                "Sweep completed"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StoreConfig, services::clock::ManualClock};
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use futures::stream;
    use std::{io, sync::Arc};

    fn setup() -> (tempfile::TempDir, Arc<ManualClock>, BlobStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 2, 28, 18, 0, 0).unwrap(),
        ));
        let store = BlobStore::with_clock(StoreConfig::new(temp_dir.path()), clock.clone());
        (temp_dir, clock, store)
    }

    async fn upload(store: &BlobStore, data: &'static [u8]) -> String {
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(data))]);
        store
            .create(body, "file.txt", data.len() as u64)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_sweep_once_reaps_only_expired() {
        let (_tmp, clock, store) = setup();
        upload(&store, b"first").await;
        clock.advance(chrono::Duration::days(3));
        let kept = upload(&store, b"second").await;

        let sweeper = Sweeper::new(
            store.clone(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        assert_eq!(sweeper.sweep_once().await, ReapReport::default());

        clock.advance(chrono::Duration::days(5));
        assert_eq!(
            sweeper.sweep_once().await,
            ReapReport {
                removed: 1,
                errors: 0
            }
        );
        assert!(store.get(&kept).await.is_ok());
    }

    #[tokio::test]
    async fn test_loop_sweeps_on_interval_and_stops_on_cancel() {
        let (_tmp, clock, store) = setup();
        upload(&store, b"expiring").await;
        clock.advance(chrono::Duration::days(8));

        let token = CancellationToken::new();
        let handle =
            Sweeper::new(store.clone(), Duration::from_millis(20), token.clone()).spawn();

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while store.stats().await.objects > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());

        // Later sweeps find nothing and the loop keeps running.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_first_sweep() {
        let (_tmp, _clock, store) = setup();
        let token = CancellationToken::new();
        let handle = Sweeper::new(store, Duration::from_secs(86_400), token.clone()).spawn();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
