//! Per-batch dispatch: a short-lived worker pool fed from one shared queue.
//!
//! [`Dispatcher::dispatch`] runs one batch end to end:
//!
//! 1. Size the pool with [`WorkerCountPolicy`] (or the fixed override).
//! 2. Start that many workers, each opening its own transport session and
//!    pulling from a bounded MPMC job queue.
//! 3. Start a feeder task that pushes every item onto the queue in batch
//!    order and then closes it.
//! 4. Start a join task that waits for every worker and then closes the
//!    result channel.
//! 5. Stream results to the client on the calling task until the result
//!    channel closes, the batch is cancelled or the client goes away.
//!
//! The call returns only after the feeder, the join task and every worker
//! have finished, so no task outlives the batch.
//!
//! [`WorkerCountPolicy`]: crate::server::pool::policy::WorkerCountPolicy

use crate::server::{
    config::DispatchConfig,
    pool::worker::{WorkerExit, WorkerSettings, WorkerTally, worker_loop},
    streaming::{
        buffer::BufferPool,
        emitter::{StreamSummary, stream_results},
    },
    telemetry::increment_deliveries_failed,
    transport::TransportProvider,
};
use core::time::Duration;
use mailly_core::types::{DeliveryResult, MessageRequest};
use std::{sync::Arc, time::Instant};
use tokio::{io::AsyncWrite, sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Error reported for items no worker could take because every session
/// failed to open.
pub const NO_CONNECTION: &str = "no delivery connection available";

/// What happened to one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub items: usize,
    pub workers: usize,
    /// Sends that completed successfully.
    pub delivered: usize,
    /// Sends that failed, timed out or were rejected.
    pub failed: usize,
    /// Workers whose initial session could not be opened.
    pub setup_failures: usize,
    /// Items reported as failed without a send attempt.
    pub orphaned: usize,
    pub stream: StreamSummary,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct JoinTally {
    delivered: usize,
    failed: usize,
    setup_failures: usize,
    orphaned: usize,
}

/// Runs batches against a shared [`TransportProvider`].
pub struct Dispatcher<P> {
    provider: Arc<P>,
    config: DispatchConfig,
    buffers: Arc<BufferPool>,
    parallelism: usize,
}

impl<P> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
            buffers: Arc::clone(&self.buffers),
            parallelism: self.parallelism,
        }
    }
}

impl<P: TransportProvider> Dispatcher<P> {
    pub fn new(provider: Arc<P>, config: DispatchConfig, buffers: Arc<BufferPool>) -> Self {
        Self {
            provider,
            config,
            buffers,
            parallelism: num_cpus::get(),
        }
    }

    /// Overrides the parallelism hint fed to the sizing policy.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Number of workers a batch of `batch_size` items runs with.
    pub fn worker_count(&self, batch_size: usize) -> usize {
        let max = self.config.policy.max_workers.max(1);
        match self.config.fixed_workers {
            Some(fixed) => fixed.clamp(1, max),
            None => self.config.policy.worker_count(batch_size, self.parallelism),
        }
    }

    /// Delivers `batch` and streams one result per item to `writer`.
    ///
    /// Results are written in completion order. Each item produces exactly
    /// one result unless `cancel` fires or the writer fails first. Items left
    /// on the queue after every worker has exited without cancellation are
    /// reported as failed with [`NO_CONNECTION`].
    pub async fn dispatch<W>(
        &self,
        batch: Vec<MessageRequest>,
        cancel: CancellationToken,
        writer: &mut W,
    ) -> DispatchReport
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let start = Instant::now();
        let items = batch.len();

        if items == 0 {
            let (_, results) = mpsc::channel(1);
            let stream = stream_results(results, writer, &self.buffers, &cancel).await;
            return DispatchReport {
                items,
                workers: 0,
                delivered: 0,
                failed: 0,
                setup_failures: 0,
                orphaned: 0,
                stream,
                elapsed: start.elapsed(),
            };
        }

        let workers = self.worker_count(items);
        let settings = WorkerSettings {
            send_timeout: self.config.send_timeout,
            close_timeout: self.config.close_timeout,
        };

        tracing::debug!("Dispatching {items} items across {workers} workers");

        // Both channels hold the whole batch, so neither the feeder nor a
        // worker can block on a slow client.
        let (job_tx, job_rx) = async_channel::bounded(items);
        let (result_tx, result_rx) = mpsc::channel(items);

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            pool.spawn(worker_loop(
                worker_id,
                Arc::clone(&self.provider),
                job_rx.clone(),
                result_tx.clone(),
                cancel.clone(),
                settings,
            ));
        }

        let feeder = tokio::spawn(feed_jobs(batch, job_tx, cancel.clone()));
        let joiner = tokio::spawn(join_workers(pool, job_rx, result_tx, cancel.clone()));

        let stream = stream_results(result_rx, writer, &self.buffers, &cancel).await;

        if let Err(e) = feeder.await {
            tracing::error!("Feeder task failed: {e}");
        }
        let tally = match joiner.await {
            Ok(tally) => tally,
            Err(e) => {
                tracing::error!("Join task failed: {e}");
                JoinTally::default()
            }
        };

        let report = DispatchReport {
            items,
            workers,
            delivered: tally.delivered,
            failed: tally.failed,
            setup_failures: tally.setup_failures,
            orphaned: tally.orphaned,
            stream,
            elapsed: start.elapsed(),
        };

        tracing::info!(
            "Batch of {} finished in {:?}: {} delivered, {} failed, {} orphaned, {} streamed ({:?})",
            report.items,
            report.elapsed,
            report.delivered,
            report.failed,
            report.orphaned,
            report.stream.emitted,
            report.stream.outcome
        );

        report
    }
}

/// Pushes every item onto the queue in batch order. Dropping the only sender
/// closes the queue.
async fn feed_jobs(
    batch: Vec<MessageRequest>,
    jobs: async_channel::Sender<MessageRequest>,
    cancel: CancellationToken,
) {
    for job in batch {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            res = jobs.send(job) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
}

/// Waits for every worker, fails any items stranded on the queue, then drops
/// the last result sender so the streamer sees the channel close.
async fn join_workers(
    mut pool: JoinSet<WorkerTally>,
    jobs: async_channel::Receiver<MessageRequest>,
    results: mpsc::Sender<DeliveryResult>,
    cancel: CancellationToken,
) -> JoinTally {
    let mut tally = JoinTally::default();

    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(worker) => {
                tally.delivered += worker.succeeded;
                tally.failed += worker.failed;
                if worker.exit == WorkerExit::SetupFailed {
                    tally.setup_failures += 1;
                }
            }
            Err(e) => tracing::error!("Worker task failed: {e}"),
        }
    }

    if cancel.is_cancelled() {
        return tally;
    }

    // Every worker is gone. Anything still queued, or still to be fed, would
    // otherwise never produce a result.
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };
        tally.orphaned += 1;
        increment_deliveries_failed();
        if results
            .send(DeliveryResult::failed(job.recipient, NO_CONNECTION))
            .await
            .is_err()
        {
            tracing::trace!("Orphaned result dropped, stream already closed");
        }
    }

    if tally.orphaned > 0 {
        tracing::warn!("{} items failed without a delivery connection", tally.orphaned);
    }

    tally
}
