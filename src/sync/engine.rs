//! Batch replication of queued events into the graph store.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{QueuedEvent, SyncQueue, SyncSignal};
use crate::config::SyncConfig;
use crate::db::lock;
use crate::error::Result;
use crate::graph::{GraphError, GraphStore};

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Due items not attempted because the store went away mid-batch.
    pub deferred: usize,
}

pub struct SyncEngine {
    queue: SyncQueue,
    graph: Arc<dyn GraphStore>,
    config: SyncConfig,
    curation: Option<mpsc::Sender<String>>,
    /// Node ids waiting for room on the curation channel.
    pending_curation: Mutex<BTreeSet<String>>,
    /// Serializes flushes from the worker and from explicit callers.
    flushing: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(queue: SyncQueue, graph: Arc<dyn GraphStore>, config: SyncConfig) -> Self {
        Self {
            queue,
            graph,
            config,
            curation: None,
            pending_curation: Mutex::new(BTreeSet::new()),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Forward node ids referenced by replicated events to the curator.
    pub fn with_curation_feed(mut self, tx: mpsc::Sender<String>) -> Self {
        self.curation = Some(tx);
        self
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Push every due queued event to the graph store.
    ///
    /// Successes are removed from the queue; failures stay queued with their
    /// retry time pushed out. Never touches the local logs.
    pub async fn flush(&self) -> Result<FlushReport> {
        let _guard = self.flushing.lock().await;
        let mut report = FlushReport::default();

        loop {
            let queue = self.queue.clone();
            let limit = self.config.batch_size.max(1);
            let batch = tokio::task::spawn_blocking(move || queue.due(Utc::now(), limit)).await??;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() == limit;

            let (acked, outage) = self.push_batch(batch, &mut report).await?;
            if outage || !full || acked == 0 {
                break;
            }
        }
        self.feed_curation();

        if report.succeeded > 0 || report.failed > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                deferred = report.deferred,
                "sync flush complete"
            );
        }
        Ok(report)
    }

    /// Returns the number acknowledged and whether the store became unavailable.
    async fn push_batch(
        &self,
        batch: Vec<QueuedEvent>,
        report: &mut FlushReport,
    ) -> Result<(usize, bool)> {
        let mut acked = Vec::new();
        let mut failures: Vec<(QueuedEvent, GraphError)> = Vec::new();
        let mut referenced = BTreeSet::new();
        let mut outage = false;

        let total = batch.len();
        for item in batch {
            if outage {
                report.deferred += 1;
                continue;
            }
            match self.graph.upsert_event(&item.event).await {
                Ok(_) => {
                    referenced.extend(item.event.node_refs.iter().cloned());
                    acked.push(item.event.id);
                }
                Err(err) => {
                    outage = err.is_unavailable();
                    failures.push((item, err));
                }
            }
        }
        debug!(total, acked = acked.len(), failed = failures.len(), "sync batch pushed");

        report.succeeded += acked.len();
        report.failed += failures.len();
        let acked_count = acked.len();

        let queue = self.queue.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            queue.ack(&acked)?;
            let now = Utc::now();
            for (item, err) in failures {
                let attempts = item.attempts.saturating_add(1);
                let delay = config.backoff(attempts);
                let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                warn!(
                    event_id = %item.event.id,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "event replication failed"
                );
                queue.record_failure(&item.event.id, attempts, retry_at, &err.to_string())?;
            }
            Ok(())
        })
        .await??;

        if self.curation.is_some() {
            lock(&self.pending_curation).extend(referenced);
        }

        Ok((acked_count, outage))
    }

    /// Hand pending node ids to the curator. Ids that do not fit stay
    /// pending until the next flush.
    fn feed_curation(&self) {
        let Some(tx) = &self.curation else {
            return;
        };
        let mut pending = lock(&self.pending_curation);
        if pending.is_empty() {
            return;
        }
        let mut kept = BTreeSet::new();
        for node_id in std::mem::take(&mut *pending) {
            match tx.try_send(node_id) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(node_id)) => {
                    kept.insert(node_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("curation channel closed; dropping pending node ids");
                    return;
                }
            }
        }
        if !kept.is_empty() {
            warn!(deferred = kept.len(), "curation channel full; node ids kept for the next flush");
        }
        *pending = kept;
    }

    /// Node ids still waiting to be handed to the curator.
    pub fn pending_curation(&self) -> usize {
        lock(&self.pending_curation).len()
    }

    async fn flush_logged(&self, reason: &'static str) {
        debug!(reason, "starting sync flush");
        if let Err(err) = self.flush().await {
            warn!(reason, error = %err, "sync flush failed");
        }
    }

    async fn over_threshold(&self) -> bool {
        let queue = self.queue.clone();
        match tokio::task::spawn_blocking(move || queue.depth()).await {
            Ok(Ok(depth)) => depth >= self.config.queue_threshold,
            Ok(Err(err)) => {
                warn!(error = %err, "failed to read sync queue depth");
                false
            }
            Err(err) => {
                warn!(error = %err, "queue depth task failed");
                false
            }
        }
    }

    /// Background loop: flush on the interval, on threshold, and on explicit
    /// request, until `shutdown` is cancelled or every signal sender is gone.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<SyncSignal>,
        shutdown: CancellationToken,
    ) {
        let mut timer = tokio::time::interval(self.config.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval().as_secs(),
            threshold = self.config.queue_threshold,
            "sync worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync worker received shutdown signal");
                    break;
                }
                _ = timer.tick() => self.flush_logged("interval").await,
                signal = signals.recv() => match signal {
                    Some(SyncSignal::FlushNow) => self.flush_logged("requested").await,
                    Some(SyncSignal::Enqueued) => {
                        if self.over_threshold().await {
                            self.flush_logged("threshold").await;
                        }
                    }
                    None => break,
                },
            }
        }
        info!("sync worker stopped");
    }
}
