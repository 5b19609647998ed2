use crate::server::{
    telemetry::{increment_deliveries_failed, increment_deliveries_succeeded, increment_setup_failures},
    transport::{Transport, TransportProvider},
};
use core::time::Duration;
use mailly_core::{
    Error,
    types::{DeliveryResult, MessageRequest},
};
use std::sync::Arc;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

/// Per-worker timeouts, copied out of the dispatch configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub send_timeout: Duration,
    pub close_timeout: Duration,
}

/// How a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerExit {
    /// The job queue was closed and drained.
    #[default]
    Drained,
    /// The cancellation signal fired.
    Cancelled,
    /// The initial session could not be opened; no job was consumed.
    SetupFailed,
    /// A session could not be re-opened after a timed-out send or one that
    /// left it broken.
    ReconnectFailed,
}

/// Counts kept locally by one worker and handed back when it terminates.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerTally {
    pub succeeded: usize,
    pub failed: usize,
    pub exit: WorkerExit,
}

/// Worker task: owns one transport session for its whole lifetime.
///
/// The worker opens its session, then pulls [`MessageRequest`]s off the shared
/// job queue until the queue is closed and empty or `cancel` fires. Every job
/// it takes yields exactly one [`DeliveryResult`] on `results`, whatever the
/// outcome of the send, unless cancellation interrupts the send itself.
///
/// # Failure handling
///
/// - Failing to open the first session ends the worker before it touches the
///   queue. The other workers absorb its share.
/// - A rejected or failed send is reported as a failed result and the loop
///   continues on the same session while it is still usable.
/// - A send that exceeds `send_timeout` is reported as failed. The session is
///   then in an unknown state, so it is closed and a new one opened; if that
///   fails the worker exits. A session the transport reports as broken after
///   a failure is replaced the same way.
///
/// The session is closed exactly once on every exit path after a successful
/// open, with the `QUIT` bounded by `close_timeout`.
pub async fn worker_loop<P: TransportProvider>(
    worker_id: usize,
    provider: Arc<P>,
    jobs: async_channel::Receiver<MessageRequest>,
    results: mpsc::Sender<DeliveryResult>,
    cancel: CancellationToken,
    settings: WorkerSettings,
) -> WorkerTally {
    tracing::trace!("Worker {worker_id} started");

    let mut tally = WorkerTally::default();

    let Some(mut conn) = connect(worker_id, provider.as_ref(), &cancel).await else {
        tally.exit = if cancel.is_cancelled() {
            WorkerExit::Cancelled
        } else {
            increment_setup_failures();
            WorkerExit::SetupFailed
        };
        return tally;
    };

    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tally.exit = WorkerExit::Cancelled;
                break;
            }
            job = jobs.recv() => match job {
                Ok(job) => job,
                // Closed and empty.
                Err(_) => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = timeout(settings.send_timeout, conn.send(&job)) => Some(res),
        };

        let Some(outcome) = outcome else {
            tracing::debug!("Worker {worker_id} abandoned send to {} on cancellation", job.recipient);
            tally.exit = WorkerExit::Cancelled;
            break;
        };

        let mut timed_out = false;
        let result = match outcome {
            Ok(Ok(())) => {
                tally.succeeded += 1;
                increment_deliveries_succeeded();
                DeliveryResult::success(job.recipient)
            }
            Ok(Err(e)) => {
                tally.failed += 1;
                increment_deliveries_failed();
                tracing::debug!("Worker {worker_id} failed to deliver to {}: {e}", job.recipient);
                DeliveryResult::failed(job.recipient, e.to_string())
            }
            Err(_elapsed) => {
                timed_out = true;
                tally.failed += 1;
                increment_deliveries_failed();
                tracing::warn!(
                    "Worker {worker_id} timed out delivering to {} after {:?}",
                    job.recipient,
                    settings.send_timeout
                );
                DeliveryResult::failed(job.recipient, Error::Timeout(settings.send_timeout).to_string())
            }
        };

        // The result channel is sized to the batch, so this only waits if
        // the streamer is gone, in which case the result is dropped.
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tally.exit = WorkerExit::Cancelled;
                break;
            }
            res = results.send(result) => {
                if res.is_err() {
                    tracing::trace!("Worker {worker_id} result dropped, stream already closed");
                }
            }
        }

        if timed_out || conn.is_broken() {
            tracing::debug!("Worker {worker_id} replacing its session");
            release(worker_id, conn, settings.close_timeout).await;
            match connect(worker_id, provider.as_ref(), &cancel).await {
                Some(fresh) => conn = fresh,
                None => {
                    tally.exit = if cancel.is_cancelled() {
                        WorkerExit::Cancelled
                    } else {
                        WorkerExit::ReconnectFailed
                    };
                    tracing::trace!("Worker {worker_id} stopped");
                    return tally;
                }
            }
        }
    }

    release(worker_id, conn, settings.close_timeout).await;

    tracing::trace!(
        "Worker {worker_id} stopped ({} sent, {} failed)",
        tally.succeeded,
        tally.failed
    );
    tally
}

/// Opens a session unless cancellation fires first. Failures are logged and
/// mapped to `None`.
async fn connect<P: TransportProvider>(
    worker_id: usize,
    provider: &P,
    cancel: &CancellationToken,
) -> Option<P::Connection> {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return None,
        res = provider.open() => res,
    };

    match opened {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::error!("Worker {worker_id} failed to connect: {e}");
            None
        }
    }
}

async fn release<T: Transport>(worker_id: usize, conn: T, close_timeout: Duration) {
    match timeout(close_timeout, conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Worker {worker_id} failed to close session cleanly: {e}"),
        Err(_) => tracing::debug!("Worker {worker_id} session close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::transport::memory::MemoryProvider;
    use mailly_core::types::DeliveryStatus;
    use portable_atomic::Ordering;

    const SETTINGS: WorkerSettings = WorkerSettings {
        send_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(1),
    };

    fn queue(recipients: &[&str]) -> async_channel::Receiver<MessageRequest> {
        let (tx, rx) = async_channel::bounded(recipients.len().max(1));
        for r in recipients {
            tx.try_send(MessageRequest::new(*r, "s", "m")).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn emits_one_result_per_job_and_keeps_going_after_failures() {
        let provider = Arc::new(MemoryProvider::new());
        let jobs = queue(&["a@x.com", "reject@x.com", "b@x.com"]);
        let (tx, mut rx) = mpsc::channel(3);

        let tally = worker_loop(0, Arc::clone(&provider), jobs, tx, CancellationToken::new(), SETTINGS).await;

        assert_eq!(tally.exit, WorkerExit::Drained);
        assert_eq!((tally.succeeded, tally.failed), (2, 1));

        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        assert_eq!(results.len(), 3);
        let rejected = results.iter().find(|r| r.recipient == "reject@x.com").unwrap();
        assert_eq!(rejected.status, DeliveryStatus::Failed);
        assert_eq!(rejected.error.as_deref(), Some("550 mailbox unavailable"));

        assert_eq!(provider.stats.opened.load(Ordering::SeqCst), 1);
        assert_eq!(provider.stats.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn setup_failure_consumes_no_jobs() {
        let provider = Arc::new(MemoryProvider::new().with_failing_opens(1));
        let jobs = queue(&["a@x.com"]);
        let (tx, _rx) = mpsc::channel(1);

        let tally = worker_loop(0, Arc::clone(&provider), jobs.clone(), tx, CancellationToken::new(), SETTINGS).await;

        assert_eq!(tally.exit, WorkerExit::SetupFailed);
        assert_eq!(jobs.len(), 1);
        assert_eq!(provider.stats.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_send_is_reported_and_session_replaced() {
        let provider = Arc::new(MemoryProvider::new());
        let jobs = queue(&["hang@x.com", "a@x.com"]);
        let (tx, mut rx) = mpsc::channel(2);

        let tally = worker_loop(0, Arc::clone(&provider), jobs, tx, CancellationToken::new(), SETTINGS).await;

        assert_eq!(tally.exit, WorkerExit::Drained);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.recipient, "hang@x.com");
        assert_eq!(first.error.as_deref(), Some("Delivery timed out after 5s"));
        assert!(rx.recv().await.unwrap().is_success());

        assert_eq!(provider.stats.opened.load(Ordering::SeqCst), 2);
        assert_eq!(provider.stats.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broken_session_is_replaced_after_a_rejection() {
        let provider = Arc::new(MemoryProvider::new());
        let jobs = queue(&["abort@x.com", "a@x.com", "b@x.com", "c@x.com"]);
        let (tx, mut rx) = mpsc::channel(4);

        let tally = worker_loop(0, Arc::clone(&provider), jobs, tx, CancellationToken::new(), SETTINGS).await;

        assert_eq!(tally.exit, WorkerExit::Drained);
        assert_eq!((tally.succeeded, tally.failed), (3, 1));

        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        let aborted = results.iter().find(|r| r.recipient == "abort@x.com").unwrap();
        assert_eq!(aborted.error.as_deref(), Some("554 transaction failed"));
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 3);

        assert_eq!(provider.stats.delivered(), ["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(provider.stats.opened.load(Ordering::SeqCst), 2);
        assert_eq!(provider.stats.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_pending_send() {
        let provider = Arc::new(MemoryProvider::new());
        let jobs = queue(&["hang@x.com"]);
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(worker_loop(0, Arc::clone(&provider), jobs, tx, cancel.clone(), SETTINGS));
        while provider.stats.send_attempts.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let tally = handle.await.unwrap();
        assert_eq!(tally.exit, WorkerExit::Cancelled);
        assert!(rx.recv().await.is_none());
        assert_eq!(provider.stats.closed.load(Ordering::SeqCst), 1);
    }
}
