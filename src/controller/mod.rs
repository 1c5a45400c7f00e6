//! Controller module
//!
//! Runs the reconciliation engine: claim events and periodic resyncs feed a
//! deduplicating work queue drained by a fixed pool of workers.
//!
//! ```text
//! ClaimEvent channel ──┐
//!                      ├──▶ WorkQueue ──▶ worker × N ──▶ Reconciler ──▶ backend
//! resync ticker ───────┘        ▲                            │
//!                               └──── retry with backoff ────┘
//! ```

mod reconciler;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::BackendRegistry;
use crate::config::ControllerConfig;
use crate::domain::{ClaimCache, ClaimEvent, EventRecorder};
use crate::error::Result;
use crate::metrics::ControllerMetrics;
use crate::queue::WorkQueue;

pub use reconciler::{Reconciler, SkipReason, SyncOutcome};

/// How often the cache sync flag is polled at startup.
const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// The reconciliation engine.
pub struct QosController {
    cache: Arc<dyn ClaimCache>,
    backends: Arc<BackendRegistry>,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<String>,
    metrics: ControllerMetrics,
    workers: usize,
    resync_period: Duration,
}

impl QosController {
    pub fn new(
        config: &ControllerConfig,
        cache: Arc<dyn ClaimCache>,
        backends: Arc<BackendRegistry>,
        recorder: Arc<dyn EventRecorder>,
        metrics: ControllerMetrics,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            cache.clone(),
            backends.clone(),
            recorder,
            metrics.clone(),
        ));
        Self {
            cache,
            backends,
            reconciler,
            queue: WorkQueue::new("volume-qos"),
            metrics,
            workers: config.workers.max(1),
            resync_period: config.resync_period,
        }
    }

    /// Handle on the work queue, mostly for inspection in tests.
    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Run until `cancel` fires.
    ///
    /// Backends are connected first; a connect failure aborts the run. Every
    /// backend is closed before this returns, whatever the outcome.
    pub async fn run(
        &self,
        events: mpsc::Receiver<ClaimEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = self.run_inner(events, cancel).await;
        self.backends.close_all().await;
        result
    }

    async fn run_inner(
        &self,
        events: mpsc::Receiver<ClaimEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.backends.connect_all().await?;

        // Drain the channel while the caches fill so the source never stalls
        let forwarder = self.spawn_event_forwarder(events, cancel.clone());

        info!("Waiting for informer caches to sync");
        if !self.wait_for_cache_sync(&cancel).await {
            info!("Cancelled before caches synced");
            self.queue.shut_down();
            if let Err(e) = forwarder.await {
                error!(error = %e, "Background task failed");
            }
            return Ok(());
        }
        info!("Caches synced");

        let keys = self.cache.claim_keys();
        info!(claims = keys.len(), "Enqueueing every cached claim");
        for key in keys {
            self.queue.add(key.to_string());
        }

        let resync = self.spawn_resync(cancel.clone());

        info!(workers = self.workers, "Starting workers");
        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| {
                let queue = self.queue.clone();
                let reconciler = self.reconciler.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(run_worker(id, queue, reconciler, metrics))
            })
            .collect();

        cancel.cancelled().await;
        info!("Shutting down workers");
        self.queue.shut_down();

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        for handle in [forwarder, resync] {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task failed");
            }
        }

        info!("Controller stopped");
        Ok(())
    }

    /// Returns `false` if cancelled first.
    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.cache.is_synced() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(CACHE_SYNC_POLL) => {}
            }
        }
    }

    fn spawn_event_forwarder(
        &self,
        mut events: mpsc::Receiver<ClaimEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            debug!(?event, "Claim event");
                            queue.add(event.into_key().to_string());
                        }
                        None => {
                            debug!("Event channel closed");
                            break;
                        }
                    },
                }
            }
        })
    }

    fn spawn_resync(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let cache = self.cache.clone();
        let period = self.resync_period;
        tokio::spawn(async move {
            if period.is_zero() {
                return;
            }
            let Some(start) = tokio::time::Instant::now().checked_add(period) else {
                warn!(?period, "Resync period out of range, periodic resync disabled");
                return;
            };
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let keys = cache.claim_keys();
                        debug!(claims = keys.len(), "Periodic resync");
                        for key in keys {
                            queue.add(key.to_string());
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for QosController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosController")
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    id: usize,
    queue: WorkQueue<String>,
    reconciler: Arc<Reconciler>,
    metrics: ControllerMetrics,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        metrics.set_queue_depth(queue.len());
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(reconciler.sync(&key)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(key = %key, panic = %panic_message(panic.as_ref()), "Reconcile panicked");
                metrics.observe_sync("panic", started.elapsed().as_secs_f64());
                queue.add_rate_limited(key.clone());
                queue.done(&key);
                continue;
            }
        };
        metrics.observe_sync(outcome.label(), started.elapsed().as_secs_f64());

        match &outcome {
            SyncOutcome::Converged | SyncOutcome::Skipped(_) => {
                queue.forget(&key);
            }
            SyncOutcome::Rejected(e) => {
                warn!(key = %key, error = %e, "Giving up on claim until it changes");
                queue.forget(&key);
            }
            SyncOutcome::Retry(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    requeues = queue.num_requeues(&key),
                    "Requeuing claim"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
