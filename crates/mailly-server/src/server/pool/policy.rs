//! Adaptive worker-count sizing.
//!
//! Opening an SMTP session costs a TCP handshake, a TLS upgrade and an AUTH
//! round trip, so small batches are cheaper on a single session. Larger
//! batches amortize that cost and benefit from parallel sessions, up to a
//! ceiling that bounds the load placed on the delivery endpoint.
//!
//! [`WorkerCountPolicy::worker_count`] is a pure function of the batch size
//! and the host parallelism hint.

/// Batches up to this size always use one worker.
pub const SMALL_BATCH: usize = 5;

/// Upper edge of the medium tier.
pub const MEDIUM_BATCH: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCountPolicy {
    /// Hard ceiling on concurrent sessions per batch.
    pub max_workers: usize,
    /// Items a worker should own before another session pays off.
    pub min_items_per_worker: usize,
    /// Sessions per logical CPU; delivery waits on the network, not the CPU.
    pub io_multiplier: usize,
    /// From this size on, the pool widens to `max_workers`.
    pub large_batch_threshold: usize,
}

impl Default for WorkerCountPolicy {
    fn default() -> Self {
        Self {
            max_workers: 25,
            min_items_per_worker: 8,
            io_multiplier: 2,
            large_batch_threshold: 1_000,
        }
    }
}

impl WorkerCountPolicy {
    /// Picks the number of workers for a batch of `batch_size` items on a host
    /// with `parallelism` logical CPUs.
    ///
    /// The result is always in `[1, max_workers]` and never decreases as
    /// `batch_size` grows.
    pub fn worker_count(&self, batch_size: usize, parallelism: usize) -> usize {
        let max_workers = self.max_workers.max(1);
        let parallelism = parallelism.max(1);
        let min_items = self.min_items_per_worker.max(1);

        let count = if batch_size <= SMALL_BATCH {
            1
        } else if batch_size <= MEDIUM_BATCH {
            (batch_size / 2).min(parallelism)
        } else {
            // The medium tier tops out here; larger batches never get fewer
            // workers than that.
            let medium_edge = (MEDIUM_BATCH / 2).min(parallelism);
            let efficiency = batch_size / min_items;
            let capacity = parallelism.saturating_mul(self.io_multiplier.max(1));
            let regular = efficiency.min(capacity).max(medium_edge);

            if batch_size >= self.large_batch_threshold {
                efficiency.min(max_workers).max(regular)
            } else {
                regular
            }
        };

        count.clamp(1, max_workers)
    }
}
