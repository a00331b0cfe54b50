// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer-group worker loop.
//!
//! A [`StreamWorker`] drives one consumer in one group:
//!
//! 1. Ensures the group exists (retrying while the store is down)
//! 2. Reclaims its own pending messages left by a previous run, paging
//!    through the pending list with an advancing cursor
//! 3. Reads new messages, blocking up to the configured timeout
//!
//! Every message goes to the [`MessageHandler`]. Successful messages are
//! acknowledged; failed ones are left pending and picked up by the reclaim
//! step of the next start. Read errors back off exponentially.
//!
//! # Graceful Shutdown
//!
//! The loop watches a `watch::Receiver<bool>` and stops as soon as it flips
//! to `true`, including while blocked in a read. A batch being handled is
//! finished and acknowledged before the worker returns.

use crate::backend::{BoxFuture, KvBackend, ReadGroupOptions, RedisStore};
use crate::config::StreamSettings;
use crate::error::Result;
use crate::metrics;
use crate::model::{epoch_millis, ConsumerGroup, StreamMessage};
use crate::resilience::RetryConfig;
use crate::stream::{calculate_lag_ms, compare_stream_ids, StreamClient};
use std::cmp::Ordering;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Processes one stream message.
///
/// Returning `Err` leaves the message pending. Delivery is at-least-once, so
/// handlers must tolerate seeing the same message again.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, message: &'a StreamMessage) -> BoxFuture<'a, ()>;
}

/// Which consumer a worker runs as, and how it reads.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub group: ConsumerGroup,
    pub consumer: String,
    pub block: Duration,
    pub batch_size: usize,
    pub reclaim_batch_size: usize,
    /// Backoff after failed reads.
    pub retry: RetryConfig,
}

impl WorkerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        settings: &StreamSettings,
    ) -> Self {
        Self {
            group: ConsumerGroup::new(stream, group),
            consumer: consumer.into(),
            block: settings.block_timeout_duration(),
            batch_size: settings.batch_size.max(1),
            reclaim_batch_size: settings.reclaim_batch_size.max(1),
            retry: RetryConfig::worker(),
        }
    }
}

/// Counts reported when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages handled successfully.
    pub processed: u64,
    /// Messages whose handler failed (left pending).
    pub failed: u64,
    /// Messages re-delivered from the pending list on start.
    pub reclaimed: u64,
}

/// Runs a [`MessageHandler`] over a consumer group.
pub struct StreamWorker<B: KvBackend = RedisStore> {
    streams: StreamClient<B>,
    config: WorkerConfig,
}

impl<B: KvBackend> StreamWorker<B> {
    pub fn new(streams: StreamClient<B>, config: WorkerConfig) -> Self {
        Self { streams, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run<H: MessageHandler>(
        &self,
        handler: &H,
        shutdown: watch::Receiver<bool>,
    ) -> WorkerStats {
        let span = info_span!(
            "stream_worker",
            stream = %self.config.group.stream_key,
            group = %self.config.group.group_name,
            consumer = %self.config.consumer
        );
        self.run_inner(handler, shutdown).instrument(span).await
    }

    async fn run_inner<H: MessageHandler>(
        &self,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!("Stream worker starting");

        if !self.ensure_group(&mut shutdown).await {
            info!("Stream worker stopped before group was ready");
            return stats;
        }

        self.reclaim(handler, &mut shutdown, &mut stats).await;
        if is_shutdown(&shutdown) {
            info!(?stats, "Stream worker stopped during reclaim");
            return stats;
        }

        let opts = ReadGroupOptions::new_messages(self.config.block, self.config.batch_size);
        // Non-blocking reads return at once; pause between empty polls
        let idle_delay = opts.block_millis().is_none().then_some(self.config.retry.initial_delay);
        let mut attempt = 0;

        loop {
            let result = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // Sender dropped counts as shutdown
                    if changed.is_err() || is_shutdown(&shutdown) {
                        break;
                    }
                    continue;
                }

                result = self.read(&opts) => result,
            };

            match result {
                Ok(batch) => {
                    attempt = 0;
                    if batch.is_empty() {
                        if let Some(delay) = idle_delay {
                            if sleep_or_shutdown(delay, &mut shutdown).await {
                                break;
                            }
                        }
                        continue;
                    }
                    self.process(handler, batch, &mut stats).await;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Stream read failed, backing off"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(
            processed = stats.processed,
            failed = stats.failed,
            reclaimed = stats.reclaimed,
            "Stream worker stopped"
        );
        stats
    }

    /// Returns `false` if shutdown was requested first.
    async fn ensure_group(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 0;
        loop {
            if is_shutdown(shutdown) {
                return false;
            }
            match self
                .streams
                .ensure_group(&self.config.group.stream_key, &self.config.group.group_name)
                .await
            {
                Ok(_) => return true,
                Err(e) => {
                    attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, "Could not create consumer group, retrying");
                    if sleep_or_shutdown(delay, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Re-deliver this consumer's pending messages, oldest first.
    async fn reclaim<H: MessageHandler>(
        &self,
        handler: &H,
        shutdown: &mut watch::Receiver<bool>,
        stats: &mut WorkerStats,
    ) {
        let mut cursor: Option<String> = None;
        let mut attempt = 0;

        loop {
            if is_shutdown(shutdown) {
                return;
            }

            let opts = ReadGroupOptions::pending(self.config.reclaim_batch_size, cursor.clone());
            let batch = match self.read(&opts).await {
                Ok(batch) => batch,
                Err(e) => {
                    attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, "Pending read failed, backing off");
                    if sleep_or_shutdown(delay, shutdown).await {
                        return;
                    }
                    continue;
                }
            };
            attempt = 0;

            let Some(last) = batch.last() else {
                debug!(reclaimed = stats.reclaimed, "Pending list drained");
                return;
            };
            if let Some(previous) = &cursor {
                if compare_stream_ids(&last.id, previous) != Ordering::Greater {
                    warn!(cursor = %previous, "Pending cursor did not advance, stopping reclaim");
                    return;
                }
            }
            // Failed messages stay pending; the cursor moves past them
            cursor = Some(last.id.clone());

            stats.reclaimed += batch.len() as u64;
            info!(count = batch.len(), "Reclaiming pending messages");
            self.process(handler, batch, stats).await;
        }
    }

    async fn read(&self, opts: &ReadGroupOptions) -> Result<Vec<StreamMessage>> {
        self.streams
            .read_group(
                &self.config.group.stream_key,
                &self.config.group.group_name,
                &self.config.consumer,
                opts,
            )
            .await
    }

    /// Handle a batch and acknowledge the successes.
    async fn process<H: MessageHandler>(
        &self,
        handler: &H,
        batch: Vec<StreamMessage>,
        stats: &mut WorkerStats,
    ) {
        let mut done = Vec::with_capacity(batch.len());
        let now = format!("{}-0", epoch_millis());

        for message in &batch {
            if let Some(lag) = calculate_lag_ms(&message.id, &now) {
                metrics::record_stream_lag(&self.config.group.stream_key, lag);
            }
            match handler.handle(message).await {
                Ok(()) => done.push(message.id.clone()),
                Err(e) => {
                    stats.failed += 1;
                    metrics::record_handler_failure(&self.config.group.stream_key);
                    warn!(id = %message.id, error = %e, "Handler failed, message left pending");
                }
            }
        }

        if done.is_empty() {
            return;
        }
        stats.processed += done.len() as u64;

        if let Err(e) = self
            .streams
            .ack(&self.config.group.stream_key, &self.config.group.group_name, &done)
            .await
        {
            // Still pending; redelivered by the next reclaim
            warn!(count = done.len(), error = %e, "Ack failed");
        }
    }
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `delay`; returns `true` if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || is_shutdown(shutdown),
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::error::CacheError;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    /// Records payloads; fails any message whose payload is `"poison"`.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Value>>,
    }

    impl MessageHandler for Recorder {
        fn handle<'a>(&'a self, message: &'a StreamMessage) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(message.payload.clone());
                if message.payload == json!("poison") {
                    return Err(CacheError::Internal("poison message".into()));
                }
                Ok(())
            })
        }
    }

    fn worker(store: &Arc<MemoryStore>) -> StreamWorker<MemoryStore> {
        let settings = StreamSettings {
            block_timeout: "20ms".to_string(),
            batch_size: 10,
            reclaim_batch_size: 2,
        };
        let mut config = WorkerConfig::new("orders", "workers", "w1", &settings);
        config.retry = RetryConfig::testing();
        StreamWorker::new(StreamClient::new(Arc::clone(store)), config)
    }

    #[test]
    fn test_worker_config_from_settings() {
        let config = WorkerConfig::new("s", "g", "c", &StreamSettings::default());
        assert_eq!(config.group, ConsumerGroup::new("s", "g"));
        assert_eq!(config.block, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retry.max_attempts, usize::MAX);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let store = Arc::new(MemoryStore::new());
        let (_tx, rx) = watch::channel(true);
        let stats = worker(&store).run(&Recorder::default(), rx).await;
        assert_eq!(stats, WorkerStats::default());
    }

    #[tokio::test]
    async fn test_processes_and_acks_new_messages() {
        let store = Arc::new(MemoryStore::new());
        let streams = StreamClient::new(Arc::clone(&store));
        streams.ensure_group("orders", "workers").await.unwrap();
        streams.publish("orders", &json!({"n": 1})).await.unwrap();
        streams.publish("orders", &json!("poison")).await.unwrap();

        let handler = Recorder::default();
        let (tx, rx) = watch::channel(false);
        let w = worker(&store);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        };
        let (stats, ()) = tokio::join!(w.run(&handler, rx), stopper);

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.reclaimed, 0);
        // The poison message stays pending
        assert_eq!(store.pending_count("orders", "workers").await, 1);
    }

    #[tokio::test]
    async fn test_group_retry_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);

        let (tx, rx) = watch::channel(false);
        let w = worker(&store);
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        };
        let recorder = Recorder::default();
        let (stats, ()) = tokio::join!(w.run(&recorder, rx), stopper);
        assert_eq!(stats, WorkerStats::default());
    }
}
