// Error handling tests for the HTTP transport and client
// Covers overload rejection, upload ceilings, unreachable servers and cancellation

use bytes::Bytes;
use speedcheck::admission::AdmissionController;
use speedcheck::config::{PhaseDurations, MIB};
use speedcheck::measurements::ByteCounter;
use speedcheck::transport::{HttpTransport, Transport};
use speedcheck::{ClientConfig, Error, Server, ServerConfig, SpeedTestClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

async fn start_server(config: ServerConfig) -> (String, Arc<AdmissionController>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(config);
    let admission = Arc::clone(server.admission());

    tokio::spawn(async move {
        let _ = server
            .serve_with_shutdown(listener, std::future::pending())
            .await;
    });
    sleep(Duration::from_millis(100)).await;

    (format!("http://{}", addr), admission)
}

#[tokio::test]
async fn test_download_rejected_when_overloaded() {
    let (base, admission) = start_server(ServerConfig::new(0).with_max_inflight_requests(1)).await;
    let _held = admission.try_admit().unwrap();

    let transport = HttpTransport::new(&ClientConfig::new(&base).with_download_size_mb(1)).unwrap();
    let counter = ByteCounter::new();

    match transport.download(&counter, &CancellationToken::new()).await {
        Err(Error::Overloaded { retry_after_secs }) => assert_eq!(retry_after_secs, 30),
        other => panic!("Expected overloaded error, got {:?}", other),
    }
    assert_eq!(counter.get(), 0);

    // Latency probes bypass admission
    assert!(transport.ping().await.is_ok());
}

#[tokio::test]
async fn test_upload_over_server_ceiling_fails() {
    let (base, admission) = start_server(ServerConfig::new(0).with_max_upload_mb(1)).await;
    let transport = HttpTransport::new(&ClientConfig::new(&base)).unwrap();

    let payload = Bytes::from(vec![0u8; 3 * MIB as usize]);
    let result = transport
        .upload(payload, &ByteCounter::new(), &CancellationToken::new())
        .await;

    match result {
        Err(Error::PayloadTooLarge { limit_bytes, .. }) => assert_eq!(limit_bytes, MIB),
        // Connection closed before the response could be read
        Err(Error::Http(_)) | Err(Error::Transport(_)) => {}
        other => panic!("Expected upload to be rejected, got {:?}", other),
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while admission.inflight() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(admission.inflight(), 0);
}

#[tokio::test]
async fn test_upload_within_ceiling_counts_all_bytes() {
    let (base, _) = start_server(ServerConfig::new(0)).await;
    let transport = HttpTransport::new(&ClientConfig::new(&base)).unwrap();
    let counter = ByteCounter::new();

    let sent = transport
        .upload(
            Bytes::from(vec![9u8; 2 * MIB as usize]),
            &counter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(sent, 2 * MIB);
    assert_eq!(counter.get(), 2 * MIB);
}

#[tokio::test]
async fn test_download_stop_returns_partial_bytes() {
    let (base, admission) = start_server(ServerConfig::new(0).with_max_download_mb(1000)).await;
    let transport =
        HttpTransport::new(&ClientConfig::new(&base).with_download_size_mb(1000)).unwrap();
    let counter = ByteCounter::new();

    let stop = CancellationToken::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let received = transport.download(&counter, &stop).await.unwrap();
    assert_eq!(received, counter.get());
    assert!(received < 1000 * MIB);

    let deadline = Instant::now() + Duration::from_secs(5);
    while admission.inflight() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(admission.inflight(), 0, "Abandoned download must release its slot");
}

#[tokio::test]
async fn test_unreachable_server_yields_no_samples() {
    let config = ClientConfig::new("http://127.0.0.1:1")
        .with_latency_probes(3, Duration::from_millis(10));
    let client = SpeedTestClient::new(config).unwrap();

    match client.run().await {
        Err(Error::NoSamples(msg)) => assert_eq!(msg, "no samples collected"),
        other => panic!("Expected no samples error, got {:?}", other.map(|r| r.timestamp)),
    }
}

#[tokio::test]
async fn test_cancel_during_run() {
    let (base, _) = start_server(ServerConfig::new(0)).await;
    let phase = PhaseDurations::new(Duration::from_secs(10), Duration::from_secs(20));
    let config = ClientConfig::new(&base)
        .with_threads(2)
        .with_download_durations(phase)
        .with_upload_durations(phase)
        .with_download_size_mb(5)
        .with_latency_probes(2, Duration::from_millis(10));
    let client = SpeedTestClient::new(config).unwrap();

    let cancel = client.cancellation_token().clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let result = client.run().await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "Cancellation should stop the run promptly"
    );
}

#[tokio::test]
async fn test_invalid_client_config_rejected() {
    let result = SpeedTestClient::new(ClientConfig::default().with_threads(9));
    assert!(matches!(result, Err(Error::Config(_))));

    let inverted = PhaseDurations::new(Duration::from_secs(5), Duration::from_secs(1));
    let result = SpeedTestClient::new(ClientConfig::default().with_download_durations(inverted));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_invalid_server_config_fails_to_start() {
    let server = Server::new(ServerConfig::new(0).with_max_inflight_requests(0));
    assert!(matches!(server.run().await, Err(Error::Config(_))));
}
