//! HTTP entry points for batch delivery.
//!
//! [`BatchService`] owns the shared [`Dispatcher`], the validation rules and the
//! shutdown state. [`BatchService::router`] exposes it as:
//!
//! - `POST /api/batch` - validate a JSON array of messages, then stream one
//!   `data: <json>` event per item as deliveries complete.
//! - `GET /api/health` - liveness, batches in flight and cumulative delivery
//!   totals. The status degrades above 5% failed deliveries and turns
//!   unhealthy (`503`) above 10%.
//!
//! ## Responsibilities
//!
//! - Reject malformed, empty, oversized or invalid batches before any worker
//!   is started.
//! - Tie each batch to a cancellation token that fires on client disconnect
//!   or server shutdown.
//! - Track in-flight batches so shutdown can drain them.

use crate::server::{
    config::ServerConfig,
    pool::manager::{DispatchReport, Dispatcher},
    streaming::{
        body::{event_pipe, event_stream_response},
        buffer::BufferPool,
    },
    telemetry::{
        decrement_batches_inflight, increment_batches, increment_batches_inflight,
        record_batch_duration, record_items_per_batch,
    },
    transport::TransportProvider,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use core::time::Duration;
use mailly_core::{Error, Result, types::MessageRequest, validation::Rules};
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::{
    io::AsyncWriteExt,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
};

/// Largest accepted request body. Sized for a full batch of long HTML
/// messages.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Idle buffers kept for encoding result frames, shared by all batches.
const POOLED_BUFFERS: usize = 256;

/// Failed-delivery percentage above which health reports `degraded`.
const DEGRADED_ERROR_RATE: f64 = 5.0;
/// Failed-delivery percentage above which health reports `unhealthy`.
const UNHEALTHY_ERROR_RATE: f64 = 10.0;

/// Deliveries counted since startup, folded in once per finished batch.
#[derive(Debug, Default)]
pub struct DeliveryTotals {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryTotals {
    pub fn record(&self, report: &DispatchReport) {
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.failed
            .fetch_add((report.failed + report.orphaned) as u64, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Failed deliveries as a percentage of all attempts, `0.0` before the
    /// first one.
    pub fn error_rate(&self) -> f64 {
        let delivered = self.delivered();
        let failed = self.failed();
        let total = delivered + failed;
        if total == 0 {
            return 0.0;
        }
        failed as f64 / total as f64 * 100.0
    }
}

pub struct BatchService<P> {
    dispatcher: Dispatcher<P>,
    rules: Arc<Rules>,
    max_batch_size: usize,
    shutdown_timeout: Duration,
    shutdown_token: CancellationToken,
    inflight: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    totals: Arc<DeliveryTotals>,
}

impl<P> Clone for BatchService<P> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            rules: Arc::clone(&self.rules),
            max_batch_size: self.max_batch_size,
            shutdown_timeout: self.shutdown_timeout,
            shutdown_token: self.shutdown_token.clone(),
            inflight: Arc::clone(&self.inflight),
            shutting_down: Arc::clone(&self.shutting_down),
            totals: Arc::clone(&self.totals),
        }
    }
}

/// Counts one batch as in flight until dropped.
struct InflightGuard {
    inflight: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<P: TransportProvider> BatchService<P> {
    pub fn new(config: &ServerConfig, provider: Arc<P>) -> Self {
        let dispatcher = Dispatcher::new(
            provider,
            config.dispatch.clone(),
            Arc::new(BufferPool::new(POOLED_BUFFERS)),
        );
        Self::from_parts(
            dispatcher,
            config.rules.clone(),
            config.max_batch_size,
            config.shutdown_timeout,
        )
    }

    pub fn from_parts(
        dispatcher: Dispatcher<P>,
        rules: Rules,
        max_batch_size: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            rules: Arc::new(rules),
            max_batch_size,
            shutdown_timeout,
            shutdown_token: CancellationToken::new(),
            inflight: Arc::new(AtomicUsize::new(0)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            totals: Arc::new(DeliveryTotals::default()),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/api/batch", post(submit_batch::<P>))
            .route("/api/health", get(health::<P>))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(
                ServiceBuilder::new()
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    )
                    .layer(SetResponseHeaderLayer::overriding(
                        header::X_CONTENT_TYPE_OPTIONS,
                        HeaderValue::from_static("nosniff"),
                    ))
                    .layer(SetResponseHeaderLayer::overriding(
                        header::X_FRAME_OPTIONS,
                        HeaderValue::from_static("DENY"),
                    ))
                    .layer(SetResponseHeaderLayer::overriding(
                        header::STRICT_TRANSPORT_SECURITY,
                        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
                    )),
            )
            .with_state(self)
    }

    pub fn batches_inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn totals(&self) -> &DeliveryTotals {
        &self.totals
    }

    /// Stops accepting batches, waits up to the shutdown timeout for running
    /// ones to finish, then cancels whatever is left.
    pub async fn shutdown(&self) {
        tracing::info!("Refusing new batches");
        self.shutting_down.store(true, Ordering::SeqCst);

        tracing::info!(
            "Draining in-flight batches ({} active)",
            self.batches_inflight()
        );
        let drained = timeout(self.shutdown_timeout, async {
            while self.batches_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight batches drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} batches still active)",
                self.batches_inflight()
            ),
        }

        tracing::debug!("Cancelling remaining batches via shutdown token");
        self.shutdown_token.cancel();
    }

    /// Registers a batch unless shutdown has begun. The counter is raised
    /// before the flag is read so a concurrent drain cannot miss it.
    fn begin_batch(&self) -> Result<InflightGuard> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            inflight: Arc::clone(&self.inflight),
        };
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        Ok(guard)
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<MessageRequest>> {
        let mut batch: Vec<MessageRequest> =
            serde_json::from_slice(body).map_err(|_| Error::MalformedBody)?;

        if batch.is_empty() {
            return Err(Error::invalid("Batch must contain at least one message"));
        }
        if batch.len() > self.max_batch_size {
            return Err(Error::invalid(format!(
                "Batch of {} messages exceeds maximum allowed ({})",
                batch.len(),
                self.max_batch_size
            )));
        }

        self.rules.validate_batch(&mut batch)?;
        Ok(batch)
    }
}

/// Handles `POST /api/batch`.
///
/// The response is returned as soon as the batch is accepted; delivery runs
/// on a spawned task that writes into the response body and finishes when
/// every item is reported, the client disconnects or the server shuts down.
#[tracing::instrument(skip_all, fields(bytes = body.len()))]
async fn submit_batch<P: TransportProvider>(
    State(service): State<BatchService<P>>,
    body: Bytes,
) -> Result<Response> {
    let guard = service.begin_batch()?;
    let batch = service.decode(&body).inspect_err(|e| {
        tracing::debug!("Rejected batch: {e}");
    })?;

    let cancel = service.shutdown_token.child_token();
    let (mut writer, stream) = event_pipe(cancel.clone());
    let response = event_stream_response(stream).map_err(|e| Error::Streaming {
        context: e.to_string(),
    })?;

    let items = batch.len();
    increment_batches();
    record_items_per_batch(items as f64);
    increment_batches_inflight();

    let dispatcher = service.dispatcher.clone();
    let totals = Arc::clone(&service.totals);
    let fut = async move {
        let _guard = guard;
        let start = Instant::now();

        let report = dispatcher.dispatch(batch, cancel, &mut writer).await;
        totals.record(&report);
        if let Err(e) = writer.shutdown().await {
            tracing::trace!("Response pipe already closed: {e}");
        }

        decrement_batches_inflight();
        record_batch_duration(start.elapsed().as_secs_f64() * 1_000.0);
    };

    let fut = {
        use tracing::Instrument;
        fut.instrument(tracing::info_span!("batch", items))
    };
    tokio::spawn(fut);

    Ok(response)
}

/// Maps the failed-delivery percentage to a health status. A degraded
/// service still answers `200`.
fn error_rate_status(error_rate: f64) -> (StatusCode, &'static str) {
    if error_rate > UNHEALTHY_ERROR_RATE {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if error_rate > DEGRADED_ERROR_RATE {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    }
}

/// Handles `GET /api/health`.
async fn health<P: TransportProvider>(State(service): State<BatchService<P>>) -> Response {
    let totals = service.totals();
    let error_rate = totals.error_rate();
    let (code, status) = if service.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        error_rate_status(error_rate)
    };

    (
        code,
        [(header::CACHE_CONTROL, "no-cache")],
        Json(serde_json::json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "batches_inflight": service.batches_inflight(),
            "deliveries": {
                "delivered": totals.delivered(),
                "failed": totals.failed(),
                "error_rate": error_rate,
            },
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{config::DispatchConfig, transport::memory::MemoryProvider};
    use axum::{body::Body, http::Request};
    use futures::StreamExt;
    use mailly_core::types::DeliveryResult;
    use tower::ServiceExt;

    fn service(provider: MemoryProvider) -> BatchService<MemoryProvider> {
        let dispatcher = Dispatcher::new(
            Arc::new(provider),
            DispatchConfig::default(),
            Arc::new(BufferPool::default()),
        );
        BatchService::from_parts(dispatcher, Rules::default(), 50, Duration::from_secs(1))
    }

    fn post_batch(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/batch")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    fn item(recipient: &str) -> serde_json::Value {
        serde_json::json!({
            "sent_to": recipient,
            "subject": "Welcome",
            "message": "<p>Hello</p>",
        })
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let response = service(MemoryProvider::new())
            .router()
            .oneshot(post_batch("[{\"sent_to\":"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"error": "Invalid JSON format"})
        );
    }

    #[tokio::test]
    async fn empty_and_oversized_batches_are_rejected() {
        let svc = service(MemoryProvider::new());

        let response = svc.clone().router().oneshot(post_batch("[]")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let too_many: Vec<_> = (0..51).map(|i| item(&format!("u{i}@example.com"))).collect();
        let response = svc
            .router()
            .oneshot(post_batch(serde_json::to_vec(&too_many).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn invalid_item_rejects_whole_batch_before_any_delivery() {
        let provider = MemoryProvider::new();
        let stats = Arc::clone(&provider.stats);
        let batch = serde_json::json!([
            item("a@example.com"),
            item("b@example.com"),
            item("not-an-email"),
        ]);

        let response = service(provider)
            .router()
            .oneshot(post_batch(batch.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"error": "item 2: sent_to is not a valid email address"})
        );
        assert_eq!(stats.open_attempts.load(Ordering::SeqCst), 0);
        assert_eq!(stats.send_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_batch_streams_one_event_per_item() {
        let provider = MemoryProvider::new();
        let stats = Arc::clone(&provider.stats);
        let svc = service(provider);
        let batch: Vec<_> = (0..7).map(|i| item(&format!("u{i}@example.com"))).collect();

        let response = svc
            .clone()
            .router()
            .oneshot(post_batch(serde_json::to_vec(&batch).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(
            headers[header::STRICT_TRANSPORT_SECURITY],
            "max-age=63072000; includeSubDomains"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = core::str::from_utf8(&bytes).unwrap();
        let results: Vec<DeliveryResult> = text
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap())
            .collect();

        assert_eq!(results.len(), 7);
        assert!(results.iter().all(DeliveryResult::is_success));
        assert_eq!(stats.delivered().len(), 7);
    }

    fn get_health() -> Request<Body> {
        Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn client_disconnect_mid_stream_cancels_the_batch() {
        let provider = MemoryProvider::new();
        let stats = Arc::clone(&provider.stats);
        let svc = service(provider);
        let batch = serde_json::json!([
            item("a@example.com"),
            item("b@example.com"),
            item("hang1@example.com"),
            item("hang2@example.com"),
        ]);

        let response = svc
            .clone()
            .router()
            .oneshot(post_batch(batch.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let mut received = Vec::new();
        while received.windows(2).filter(|w| *w == b"\n\n").count() < 2 {
            let chunk = body.next().await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        let frames = core::str::from_utf8(&received).unwrap();
        assert!(frames.starts_with("data: "));
        assert!(!frames.contains("hang"));
        drop(body);

        let drained = timeout(Duration::from_secs(5), async {
            while svc.batches_inflight() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(
            stats.opened.load(Ordering::SeqCst),
            stats.closed.load(Ordering::SeqCst)
        );
        assert_eq!(stats.delivered().len(), 2);
    }

    #[test]
    fn error_rate_thresholds() {
        assert_eq!(error_rate_status(0.0), (StatusCode::OK, "healthy"));
        assert_eq!(error_rate_status(5.0), (StatusCode::OK, "healthy"));
        assert_eq!(error_rate_status(5.1), (StatusCode::OK, "degraded"));
        assert_eq!(error_rate_status(10.0), (StatusCode::OK, "degraded"));
        assert_eq!(
            error_rate_status(10.5),
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        );
    }

    #[tokio::test]
    async fn health_reflects_delivery_totals() {
        let svc = service(MemoryProvider::new());
        let batch = serde_json::json!([item("a@example.com"), item("reject@example.com")]);

        let response = svc
            .clone()
            .router()
            .oneshot(post_batch(batch.to_string()))
            .await
            .unwrap();
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        let response = svc.clone().router().oneshot(get_health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["deliveries"]["delivered"], 1);
        assert_eq!(body["deliveries"]["failed"], 1);
        assert_eq!(body["deliveries"]["error_rate"], 50.0);
    }

    #[tokio::test]
    async fn health_reports_status_and_inflight_count() {
        let response = service(MemoryProvider::new())
            .router()
            .oneshot(get_health())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["batches_inflight"], 0);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["deliveries"]["delivered"], 0);
        assert_eq!(body["deliveries"]["error_rate"], 0.0);
    }

    #[tokio::test]
    async fn batches_are_refused_after_shutdown() {
        let svc = service(MemoryProvider::new());
        svc.shutdown().await;

        let response = svc
            .clone()
            .router()
            .oneshot(post_batch(serde_json::json!([item("a@example.com")]).to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(svc.batches_inflight(), 0);

        let response = svc
            .router()
            .oneshot(get_health())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn shutdown_cancels_batches_that_outlive_the_drain() {
        let svc = BatchService::from_parts(
            Dispatcher::new(
                Arc::new(MemoryProvider::new()),
                DispatchConfig::default(),
                Arc::new(BufferPool::default()),
            ),
            Rules::default(),
            50,
            Duration::from_millis(200),
        );

        let response = svc
            .clone()
            .router()
            .oneshot(post_batch(serde_json::json!([item("hang@example.com")]).to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(svc.batches_inflight(), 1);

        svc.shutdown().await;

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());
        while svc.batches_inflight() > 0 {
            tokio::task::yield_now().await;
        }
    }
}
