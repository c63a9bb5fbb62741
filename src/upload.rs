//! Upload body accounting with a per-request ceiling.

use crate::measurements::{ServerStats, TransferDirection};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tokio::time::Instant;

/// Successful upload accounting, serialized as the response body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub received_bytes: u64,
    pub duration_ms: u64,
    /// Rounded to two decimals
    pub speed_mbps: f64,
}

/// Counts an incoming body and enforces the upload ceiling.
///
/// # Examples
///
/// ```
/// use speedcheck::upload::UploadReceiver;
/// use bytes::Bytes;
/// use futures::stream;
///
/// # #[tokio::main]
/// # async fn main() {
/// let receiver = UploadReceiver::new(1024);
///
/// let body = stream::iter(vec![
///     Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 512])),
///     Ok(Bytes::from(vec![0u8; 512])),
/// ]);
/// let summary = receiver.receive(body).await.unwrap();
/// assert_eq!(summary.received_bytes, 1024);
///
/// let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 2048]))]);
/// assert!(receiver.receive(body).await.is_err());
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct UploadReceiver {
    limit_bytes: u64,
}

impl UploadReceiver {
    pub fn new(limit_bytes: u64) -> Self {
        Self { limit_bytes }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Reads `body` to the end.
    ///
    /// Reading stops at the first chunk that takes the running total past the
    /// limit; the rest of the body is dropped unread. The duration runs from
    /// the first received byte to the end of the body.
    ///
    /// # Errors
    ///
    /// * `Error::PayloadTooLarge` when the limit is exceeded
    /// * `Error::Transport` when the body fails midway
    pub async fn receive<S, E>(&self, body: S) -> Result<UploadSummary>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        futures::pin_mut!(body);

        let mut received = 0u64;
        let mut first_byte: Option<Instant> = None;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                debug!("Client disconnected during upload: received={}", received);
                Error::Transport(format!("upload body interrupted: {}", e))
            })?;

            if chunk.is_empty() {
                continue;
            }
            first_byte.get_or_insert_with(Instant::now);

            received += chunk.len() as u64;
            if received > self.limit_bytes {
                warn!(
                    "Upload size exceeded limit: received={} limit={}",
                    received, self.limit_bytes
                );
                return Err(Error::PayloadTooLarge {
                    limit_bytes: self.limit_bytes,
                    received_bytes: received,
                });
            }
        }

        let elapsed = first_byte.map(|t| t.elapsed()).unwrap_or_default();
        let secs = elapsed.as_secs_f64();
        let speed_mbps = if secs > 0.0 {
            ((received as f64 * 8.0) / secs / 1_000_000.0 * 100.0).round() / 100.0
        } else {
            0.0
        };

        Ok(UploadSummary {
            received_bytes: received,
            duration_ms: elapsed.as_millis() as u64,
            speed_mbps,
        })
    }

    /// Like [`receive`](Self::receive), recording successful uploads in `stats`.
    pub async fn receive_with_stats<S, E>(&self, body: S, stats: &ServerStats) -> Result<UploadSummary>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let summary = self.receive(body).await?;
        stats.record(TransferDirection::Upload, summary.received_bytes);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn chunks(sizes: &[usize]) -> Vec<io::Result<Bytes>> {
        sizes.iter().map(|&n| Ok(Bytes::from(vec![7u8; n]))).collect()
    }

    #[tokio::test]
    async fn test_exact_limit_is_accepted() {
        let receiver = UploadReceiver::new(3000);
        let summary = receiver
            .receive(stream::iter(chunks(&[1000, 1000, 1000])))
            .await
            .unwrap();
        assert_eq!(summary.received_bytes, 3000);
    }

    #[tokio::test]
    async fn test_stops_reading_past_limit() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polled);
        let body = stream::iter(chunks(&[400; 100])).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let receiver = UploadReceiver::new(1000);
        match receiver.receive(body).await {
            Err(Error::PayloadTooLarge {
                limit_bytes,
                received_bytes,
            }) => {
                assert_eq!(limit_bytes, 1000);
                assert_eq!(received_bytes, 1200);
                assert!(received_bytes <= limit_bytes + 400);
            }
            other => panic!("Expected payload too large, got {:?}", other),
        }
        assert_eq!(polled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let receiver = UploadReceiver::new(1000);
        let summary = receiver.receive(stream::iter(chunks(&[]))).await.unwrap();
        assert_eq!(summary.received_bytes, 0);
        assert_eq!(summary.duration_ms, 0);
        assert_eq!(summary.speed_mbps, 0.0);
    }

    #[tokio::test]
    async fn test_interrupted_body_is_transport_error() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let stats = ServerStats::new();
        let receiver = UploadReceiver::new(1000);

        let result = receiver.receive_with_stats(body, &stats).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(stats.snapshot().uploads_completed, 0);
    }

    #[tokio::test]
    async fn test_success_recorded_in_stats() {
        let stats = ServerStats::new();
        let receiver = UploadReceiver::new(10_000);
        receiver
            .receive_with_stats(stream::iter(chunks(&[2500, 2500])), &stats)
            .await
            .unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.upload_bytes, 5000);
        assert_eq!(snapshot.uploads_completed, 1);
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let summary = UploadSummary {
            received_bytes: 10,
            duration_ms: 5,
            speed_mbps: 0.02,
        };
        let json = serde_json::to_value(summary).unwrap();
        assert_eq!(json["receivedBytes"], 10);
        assert_eq!(json["durationMs"], 5);
    }
}
