//! Client side network operations.
//!
//! The orchestrator and the latency probe only talk to the [`Transport`]
//! trait, so tests can drive them with a simulated network.

use crate::config::{ClientConfig, RETRY_AFTER_SECS};
use crate::measurements::ByteCounter;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::debug;
use reqwest::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Size of the slices an upload body is handed to the HTTP stack in.
pub const UPLOAD_SLICE_BYTES: usize = 64 * 1024;

/// Network operations needed by a measurement run.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs one minimal round trip.
    async fn ping(&self) -> Result<()>;

    /// Performs one download request, adding received bytes to `counter` as
    /// they arrive.
    ///
    /// When `stop` fires the read is abandoned and the bytes received so far
    /// are returned as a success.
    async fn download(&self, counter: &ByteCounter, stop: &CancellationToken) -> Result<u64>;

    /// Sends `payload` as one upload request, adding bytes to `counter` as
    /// they are handed to the network.
    ///
    /// An upload is only interrupted by `abort`, which yields
    /// `Error::Cancelled`.
    async fn upload(
        &self,
        payload: Bytes,
        counter: &ByteCounter,
        abort: &CancellationToken,
    ) -> Result<u64>;
}

/// [`Transport`] speaking HTTP to a speedcheck server.
///
/// # Examples
///
/// ```
/// use speedcheck::transport::HttpTransport;
/// use speedcheck::ClientConfig;
///
/// let transport = HttpTransport::new(&ClientConfig::new("http://127.0.0.1:3000")).unwrap();
/// assert_eq!(transport.base_url(), "http://127.0.0.1:3000");
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    download_size_mb: u64,
    chunk_kb: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TooLargeBody {
    limit_bytes: u64,
}

impl HttpTransport {
    /// Builds the HTTP client with the connect timeout and an overall request
    /// timeout of the longest phase plus grace.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            download_size_mb: config.download_size_mb,
            chunk_kb: config.chunk_kb,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds an endpoint URL with a cache-busting nonce.
    fn url(&self, path: &str, query: &str) -> String {
        let nonce = rand::random::<u64>();
        if query.is_empty() {
            format!("{}{}?nonce={:x}", self.base_url, path, nonce)
        } else {
            format!("{}{}?{}&nonce={:x}", self.base_url, path, query, nonce)
        }
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(RETRY_AFTER_SECS);
        return Err(Error::Overloaded { retry_after_secs });
    }
    Err(Error::Transport(format!("server responded with {}", status)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/transfer/ping", ""))
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await?;
        let response = check_status(response)?;
        response.bytes().await?;
        Ok(())
    }

    async fn download(&self, counter: &ByteCounter, stop: &CancellationToken) -> Result<u64> {
        let url = self.url(
            "/transfer/download",
            &format!("size={}&chunk={}", self.download_size_mb, self.chunk_kb),
        );
        let request = self.client.get(url).header(CACHE_CONTROL, "no-store").send();

        let response = tokio::select! {
            _ = stop.cancelled() => return Ok(0),
            response = request => check_status(response?)?,
        };

        let mut stream = response.bytes_stream();
        let mut received = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Download read stopped after {} bytes", received);
                    break;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        received += chunk.len() as u64;
                        counter.add(chunk.len() as u64);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }

        Ok(received)
    }

    async fn upload(
        &self,
        payload: Bytes,
        counter: &ByteCounter,
        abort: &CancellationToken,
    ) -> Result<u64> {
        let len = payload.len();
        let slices: Vec<Bytes> = (0..len)
            .step_by(UPLOAD_SLICE_BYTES)
            .map(|start| payload.slice(start..(start + UPLOAD_SLICE_BYTES).min(len)))
            .collect();

        let progress = counter.clone();
        let body = futures::stream::iter(slices).map(move |slice| {
            progress.add(slice.len() as u64);
            Ok::<_, std::io::Error>(slice)
        });

        let request = self
            .client
            .post(self.url("/transfer/upload", ""))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .header(CACHE_CONTROL, "no-store")
            .body(reqwest::Body::wrap_stream(body))
            .send();

        let response = tokio::select! {
            _ = abort.cancelled() => return Err(Error::Cancelled),
            response = request => response?,
        };

        if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
            let limit_bytes = response
                .json::<TooLargeBody>()
                .await
                .map(|b| b.limit_bytes)
                .unwrap_or_default();
            return Err(Error::PayloadTooLarge {
                limit_bytes,
                received_bytes: len as u64,
            });
        }
        let response = check_status(response)?;

        tokio::select! {
            _ = abort.cancelled() => Err(Error::Cancelled),
            body = response.bytes() => {
                body?;
                Ok(len as u64)
            }
        }
    }
}
