use crate::admission::AdmissionController;
use crate::config::ServerConfig;
use crate::generator::{ByteStreamGenerator, DownloadParams};
use crate::measurements::ServerStats;
use crate::upload::UploadReceiver;
use crate::{Error, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Name reported by the info endpoint.
pub const SERVER_NAME: &str = "SpeedCheck Speed Test Server";

const DEFAULT_PING_BATCH: u64 = 10;
const MAX_PING_BATCH: u64 = 100;

/// HTTP measurement server.
///
/// Serves random download streams, accepts uploads and answers latency probes.
/// Transfer endpoints are gated by an [`AdmissionController`].
///
/// # Endpoints
///
/// - `GET /transfer/download?size=<MB>&chunk=<KB>`
/// - `POST /transfer/upload`
/// - `GET /transfer/ping`
/// - `POST /transfer/ping-batch` with an optional `{"count": n}` body
/// - `GET /transfer/test`
/// - `GET /transfer/info`
/// - `GET /health`
///
/// # Examples
///
/// ```no_run
/// use speedcheck::{Server, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::new(3000).with_max_download_mb(100);
/// let server = Server::new(config);
///
/// println!("Starting server on port 3000...");
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    admission: Arc<AdmissionController>,
    stats: Arc<ServerStats>,
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    admission: Arc<AdmissionController>,
    stats: Arc<ServerStats>,
    started_at: Instant,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    size: Option<String>,
    chunk: Option<String>,
}

impl Server {
    /// Creates a server with its own admission controller and statistics.
    ///
    /// # Examples
    ///
    /// ```
    /// use speedcheck::{Server, ServerConfig};
    ///
    /// let server = Server::new(ServerConfig::new(3000).with_max_inflight_requests(10));
    /// assert_eq!(server.admission().max_inflight(), 10);
    /// ```
    pub fn new(config: ServerConfig) -> Self {
        let admission = Arc::new(AdmissionController::new(config.max_inflight_requests));
        Self {
            config,
            admission,
            stats: Arc::new(ServerStats::new()),
        }
    }

    /// Replaces the admission controller, e.g. to share one between servers
    /// or to inspect it from a test.
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = admission;
        self
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Builds the axum router with all endpoints and the CORS layer.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::new(self.config.clone()),
            admission: Arc::clone(&self.admission),
            stats: Arc::clone(&self.stats),
            started_at: Instant::now(),
        };

        Router::new()
            .route("/transfer/download", get(download))
            .route("/transfer/upload", post(upload))
            .route("/transfer/ping", get(ping))
            .route("/transfer/ping-batch", post(ping_batch))
            .route("/transfer/test", get(connection_test))
            .route("/transfer/info", get(info))
            .route("/health", get(health))
            .fallback(not_found)
            .with_state(state)
            .layer(cors_layer(&self.config.cors_origin))
    }

    /// Starts listening on the configured address and serves until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the port cannot
    /// be bound.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;

        let addr = SocketAddr::new(
            self.config
                .bind_addr
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.config.port,
        );
        let listener = TcpListener::bind(addr).await?;

        info!("Starting speedcheck server on {}", addr);
        info!("Server location: {}", self.config.server_location);
        info!("CORS origin(s): {}", self.config.cors_origin);
        info!(
            "Max download size: {}MB, max upload size: {}MB, max inflight requests: {}",
            self.config.max_download_mb,
            self.config.max_upload_mb,
            self.config.max_inflight_requests
        );

        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serves on an already bound listener until `signal` completes.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
            .await?;
        info!("Server stopped");
        Ok(())
    }

    /// Serves on an already bound listener until the process is interrupted.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, closing server...");
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_TYPE]);

    if origin.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origin
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

/// GET /transfer/download
async fn download(State(state): State<AppState>, Query(query): Query<DownloadQuery>) -> Response {
    let guard = match state.admission.try_admit() {
        Ok(guard) => guard,
        Err(e) => return e.into_response(),
    };

    let params = DownloadParams::from_query(
        query.size.as_deref(),
        query.chunk.as_deref(),
        state.config.max_download_mb,
    );
    debug!(
        "Download request: size={} bytes, chunk={} bytes",
        params.size_bytes, params.chunk_bytes
    );

    let (mut tx, rx) = mpsc::channel::<Bytes>(1);
    let stats = Arc::clone(&state.stats);
    tokio::spawn(async move {
        let outcome = ByteStreamGenerator::new(params)
            .run_with_stats(&mut tx, &stats)
            .await;
        debug!(
            "Download finished: sent={} completed={} backpressure_waits={}",
            outcome.bytes_sent, outcome.completed, outcome.backpressure_waits
        );
        guard.release();
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, params.size_bytes.to_string()),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        body,
    )
        .into_response()
}

/// POST /transfer/upload
async fn upload(State(state): State<AppState>, body: Body) -> Response {
    let guard = match state.admission.try_admit() {
        Ok(guard) => guard,
        Err(e) => return e.into_response(),
    };

    let receiver = UploadReceiver::new(state.config.upload_limit_bytes());
    let result = receiver
        .receive_with_stats(body.into_data_stream(), &state.stats)
        .await;
    guard.release();

    match result {
        Ok(summary) => {
            debug!(
                "Upload finished: {} bytes in {}ms ({} Mbps)",
                summary.received_bytes, summary.duration_ms, summary.speed_mbps
            );
            Json(json!({
                "success": true,
                "receivedBytes": summary.received_bytes,
                "durationMs": summary.duration_ms,
                "speedMbps": summary.speed_mbps,
            }))
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// GET /transfer/ping
async fn ping() -> Json<serde_json::Value> {
    Json(json!({
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "server": "ok",
    }))
}

/// POST /transfer/ping-batch
async fn ping_batch(body: Bytes) -> Response {
    let Some(count) = batch_count(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid count parameter. Must be a positive number." })),
        )
            .into_response();
    };

    let measurements: Vec<serde_json::Value> = (0..count)
        .map(|id| {
            json!({
                "id": id,
                "timestamp": chrono::Utc::now().timestamp_millis(),
                "nonce": format!("{:016x}", rand::random::<u64>()),
            })
        })
        .collect();

    Json(json!({
        "measurements": measurements,
        "serverTime": chrono::Utc::now().timestamp_millis(),
        "count": count,
    }))
    .into_response()
}

/// Reads `count` from a ping batch body and clamps it to `[1, 100]`.
///
/// An empty body or a missing count means the default of 10. A negative,
/// non-numeric or malformed value yields `None`.
fn batch_count(body: &[u8]) -> Option<u64> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Some(DEFAULT_PING_BATCH);
    }

    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let count = match value.get("count") {
        None | Some(serde_json::Value::Null) => return Some(DEFAULT_PING_BATCH),
        Some(serde_json::Value::Number(n)) => n.as_f64()?,
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok()?,
        Some(_) => return None,
    };

    if !count.is_finite() || count < 0.0 {
        return None;
    }
    Some((count.trunc() as u64).clamp(1, MAX_PING_BATCH))
}

/// GET /transfer/test
async fn connection_test(ConnectInfo(peer): ConnectInfo<SocketAddr>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "Connection successful",
        "clientIp": peer.ip().to_string(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

/// GET /transfer/info
async fn info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": SERVER_NAME,
        "location": state.config.server_location,
        "maxDownloadSize": state.config.max_download_mb,
        "maxUploadSize": state.config.max_upload_mb,
        "maxInflightRequests": state.config.max_inflight_requests,
        "inflightRequests": state.admission.inflight(),
        "version": crate::VERSION,
        "stats": state.stats.snapshot(),
    }))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Endpoint not found" })),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Overloaded { retry_after_secs } => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({
                    "error": "Service temporarily overloaded",
                    "retryAfter": retry_after_secs,
                })),
            )
                .into_response(),
            Error::PayloadTooLarge { limit_bytes, .. } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                [(header::CONNECTION, "close".to_string())],
                Json(json!({
                    "error": "Upload too large",
                    "limitBytes": limit_bytes,
                })),
            )
                .into_response(),
            Error::Transport(msg) => {
                debug!("Transfer failed: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Upload failed" })),
                )
                    .into_response()
            }
            other => {
                error!("Server error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}
