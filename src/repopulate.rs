// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background repopulation pool.
//!
//! Cache refreshes triggered by a read miss must not delay the read, and
//! their failures must not reach the reader. Jobs are queued here and run
//! on their own tasks:
//!
//! ```text
//! dispatch() ──try_send──► [bounded mpsc] ──► dispatcher ──permit──► tokio::spawn(job)
//!     │                                           │
//!     └─ queue full: dropped + warn               └─ Bulkhead caps running jobs
//! ```
//!
//! Job failures are logged here at `warn` and counted; nobody awaits them.
//! [`Repopulator::wait_idle`] resolves once nothing is queued or running,
//! which tests and graceful shutdown rely on.
//!
//! The dispatcher task starts on the first [`Repopulator::dispatch`] made
//! inside a Tokio runtime, so the pool itself can be built anywhere. A
//! dispatch with no runtime available drops the job.

use crate::config::RepopulationConfig;
use crate::error::Result;
use crate::metrics;
use crate::resilience::Bulkhead;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

struct Job {
    label: String,
    future: JobFuture,
}

/// Decrements the in-flight count when a job ends, panics included.
struct InFlightGuard(Arc<watch::Sender<usize>>);

impl InFlightGuard {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        metrics::set_repopulation_in_flight(*counter.borrow());
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
        metrics::set_repopulation_in_flight(*self.0.borrow());
    }
}

/// What the dispatcher needs to run, held until it is spawned.
struct DispatcherParts {
    receiver: mpsc::Receiver<(Job, InFlightGuard)>,
    shutdown: watch::Receiver<bool>,
    bulkhead: Bulkhead,
}

enum Dispatcher {
    NotStarted(DispatcherParts),
    Running(JoinHandle<()>),
    Stopped,
}

/// Fire-and-forget job pool with bounded queue and concurrency.
pub struct Repopulator {
    sender: mpsc::Sender<(Job, InFlightGuard)>,
    in_flight: Arc<watch::Sender<usize>>,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Dispatcher>,
    closed: AtomicBool,
}

impl Repopulator {
    /// Create the pool. Nothing runs until the first dispatch.
    pub fn new(config: &RepopulationConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let parts = DispatcherParts {
            receiver,
            shutdown: shutdown_rx,
            bulkhead: Bulkhead::new(config.max_concurrent.max(1)),
        };

        Self {
            sender,
            in_flight: Arc::new(watch::channel(0).0),
            shutdown,
            dispatcher: Mutex::new(Dispatcher::NotStarted(parts)),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the dispatcher task has been spawned.
    pub fn is_started(&self) -> bool {
        matches!(*self.lock_dispatcher(), Dispatcher::Running(_))
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Dispatcher> {
        // Every transition replaces the state whole, so a poisoned value is usable
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the dispatcher on the current runtime if not yet running.
    fn ensure_started(&self) -> bool {
        let mut dispatcher = self.lock_dispatcher();
        match std::mem::replace(&mut *dispatcher, Dispatcher::Stopped) {
            Dispatcher::NotStarted(parts) => match Handle::try_current() {
                Ok(runtime) => {
                    *dispatcher = Dispatcher::Running(runtime.spawn(run_dispatcher(parts)));
                    debug!("Repopulation dispatcher started");
                    true
                }
                Err(_) => {
                    *dispatcher = Dispatcher::NotStarted(parts);
                    false
                }
            },
            running @ Dispatcher::Running(_) => {
                *dispatcher = running;
                true
            }
            Dispatcher::Stopped => false,
        }
    }

    /// Queue a job without waiting.
    ///
    /// Returns `false` if the job was dropped (queue full or pool closed).
    pub fn dispatch<F>(&self, label: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        if self.closed.load(Ordering::Acquire) {
            warn!(job = %label, "Repopulation pool closed, job dropped");
            metrics::record_repopulation("dropped");
            return false;
        }
        if !self.ensure_started() {
            warn!(job = %label, "No Tokio runtime for repopulation, job dropped");
            metrics::record_repopulation("dropped");
            return false;
        }

        let guard = InFlightGuard::enter(&self.in_flight);
        let job = Job {
            label,
            future: Box::pin(job),
        };

        match self.sender.try_send((job, guard)) {
            Ok(()) => true,
            Err(e) => {
                // Guard inside the rejected message is dropped here
                let (job, _guard) = e.into_inner();
                warn!(job = %job.label, "Repopulation queue full, job dropped");
                metrics::record_repopulation("dropped");
                false
            }
        }
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until no job is queued or running.
    pub async fn wait_idle(&self) {
        let mut receiver = self.in_flight.subscribe();
        // Sender lives in self, so the channel cannot close while we wait
        let _ = receiver.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting jobs, finish the queued ones, and wait for them.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);

        let dispatcher = std::mem::replace(&mut *self.lock_dispatcher(), Dispatcher::Stopped);
        if let Dispatcher::Running(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Repopulation dispatcher ended abnormally");
            }
        }
        self.wait_idle().await;
        info!("Repopulation pool closed");
    }
}

async fn run_dispatcher(parts: DispatcherParts) {
    let DispatcherParts {
        mut receiver,
        mut shutdown,
        bulkhead,
    } = parts;
    let mut draining = false;

    loop {
        let next = tokio::select! {
            changed = shutdown.changed(), if !draining => {
                // Sender gone counts as shutdown
                if changed.is_err() || *shutdown.borrow() {
                    draining = true;
                    receiver.close();
                }
                continue;
            }
            next = receiver.recv() => next,
        };

        let Some((job, guard)) = next else {
            break;
        };

        let permit = match bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(job = %job.label, error = %e, "Repopulation job dropped");
                metrics::record_repopulation("dropped");
                continue;
            }
        };

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            match job.future.await {
                Ok(()) => {
                    debug!(job = %job.label, "Repopulation job finished");
                    metrics::record_repopulation("succeeded");
                }
                Err(e) => {
                    warn!(job = %job.label, error = %e, "Repopulation job failed");
                    metrics::record_repopulation("failed");
                }
            }
        });
    }

    debug!("Repopulation dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config(queue_capacity: usize, max_concurrent: usize) -> RepopulationConfig {
        RepopulationConfig {
            queue_capacity,
            max_concurrent,
        }
    }

    #[test]
    fn test_built_outside_runtime_starts_on_first_dispatch() {
        let pool = Repopulator::new(&config(4, 1));
        assert!(!pool.is_started());
        assert!(!pool.dispatch("no runtime", async { Ok(()) }));
        assert_eq!(pool.in_flight(), 0);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        runtime.block_on(async {
            assert!(pool.dispatch("in runtime", async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }));
            assert!(pool.is_started());
            pool.wait_idle().await;
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_jobs_run_and_pool_goes_idle() {
        let pool = Repopulator::new(&config(16, 4));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(pool.dispatch(format!("job-{}", i), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        pool.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_poison_pool() {
        let pool = Repopulator::new(&config(4, 1));
        pool.dispatch("fails", async { Err(CacheError::Internal("boom".into())) });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.dispatch("succeeds", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        pool.wait_idle().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let pool = Repopulator::new(&config(32, 2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.dispatch(format!("job-{}", i), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        pool.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_jobs() {
        let pool = Repopulator::new(&config(1, 1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        // Occupies the only permit until released
        pool.dispatch("blocker", async move {
            let _ = release_rx.await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One slot in the queue, then full
        let mut accepted = 0;
        for i in 0..5 {
            if pool.dispatch(format!("job-{}", i), async { Ok(()) }) {
                accepted += 1;
            }
        }
        assert!(accepted < 5, "a bounded queue must reject some jobs");

        let _ = release_tx.send(());
        pool.wait_idle().await;
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_finishes_queued_and_rejects_new() {
        let pool = Repopulator::new(&config(8, 1));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.dispatch("job", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!pool.dispatch("late", async { Ok(()) }));

        // Second close is a no-op
        pool.close().await;
    }
}
