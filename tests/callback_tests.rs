// Tests for progress callbacks during a full client run
// Durations are kept short so each run finishes in a few seconds on loopback

use speedcheck::config::PhaseDurations;
use speedcheck::{
    ClientConfig, ProgressCallback, ProgressEvent, Server, ServerConfig, SpeedTestClient,
    StopReason, TransferDirection,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Test callback that collects all events
#[derive(Clone)]
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn get_events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(ServerConfig::new(0));

    tokio::spawn(async move {
        let _ = server
            .serve_with_shutdown(listener, std::future::pending())
            .await;
    });
    // Give server time to start
    sleep(Duration::from_millis(100)).await;

    format!("http://{}", addr)
}

fn quick_config(base_url: &str) -> ClientConfig {
    let phase = PhaseDurations::new(Duration::from_millis(500), Duration::from_secs(1));
    ClientConfig::new(base_url)
        .with_threads(2)
        .with_download_durations(phase)
        .with_upload_durations(phase)
        .with_download_size_mb(5)
        .with_upload_size_mb(1)
        .with_update_interval(Duration::from_millis(50))
        .with_sample_interval(Duration::from_millis(100))
        .with_grace(Duration::from_secs(2))
        .with_latency_probes(3, Duration::from_millis(10))
}

#[tokio::test]
async fn test_full_run_emits_lifecycle_events() {
    let base = start_server().await;
    let callback = TestCallback::new();

    let client = SpeedTestClient::new(quick_config(&base))
        .unwrap()
        .with_callback(callback.clone());

    let report = client.run().await.unwrap();
    let events = callback.get_events();

    assert!(
        matches!(events.first(), Some(ProgressEvent::TestStarted)),
        "First event should be TestStarted"
    );
    assert!(
        matches!(events.last(), Some(ProgressEvent::TestCompleted { .. })),
        "Last event should be TestCompleted"
    );

    let latency_samples = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::LatencySample { .. }))
        .count();
    assert_eq!(latency_samples, 3);

    let phases: Vec<TransferDirection> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::PhaseStarted { direction, threads } => {
                assert_eq!(*threads, 2);
                Some(*direction)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![TransferDirection::Download, TransferDirection::Upload],
        "Download runs before upload"
    );

    let completed = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::PhaseCompleted { .. }))
        .count();
    assert_eq!(completed, 2);

    assert!(
        events
            .iter()
            .any(|e| matches!(e, ProgressEvent::LiveThroughput { .. })),
        "Should receive live throughput updates"
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Error(_))));

    assert!(report.download.bytes_transferred > 0);
    assert!(report.upload.bytes_transferred > 0);
    assert!(report.download.speed_mbps > 0.0);
    assert!(report.upload.speed_mbps > 0.0);
    assert_eq!(report.latency.samples_ms.len(), 3);
    assert!(report.timestamp > 0);
    assert!(matches!(
        report.download.stop_reason,
        StopReason::Stabilized | StopReason::MaxDurationReached
    ));
}

#[tokio::test]
async fn test_live_throughput_is_monotonic_in_bytes() {
    let base = start_server().await;
    let callback = TestCallback::new();

    let client = SpeedTestClient::new(quick_config(&base))
        .unwrap()
        .with_callback(callback.clone());
    client.measure_download().await.unwrap();

    let ticks: Vec<(Duration, u64)> = callback
        .get_events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::LiveThroughput {
                direction: TransferDirection::Download,
                elapsed,
                bytes,
                ..
            } => Some((elapsed, bytes)),
            _ => None,
        })
        .collect();

    assert!(!ticks.is_empty());
    for pair in ticks.windows(2) {
        assert!(pair[1].0 >= pair[0].0, "Elapsed time must not go backwards");
        assert!(pair[1].1 >= pair[0].1, "Byte totals must not decrease");
    }
}

#[tokio::test]
async fn test_speed_samples_match_phase_result() {
    let base = start_server().await;
    let callback = TestCallback::new();

    let client = SpeedTestClient::new(quick_config(&base))
        .unwrap()
        .with_callback(callback.clone());
    let result = client.measure_upload().await.unwrap();

    let reported: Vec<f64> = callback
        .get_events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::SpeedSample { sample, .. } => Some(sample.mbps),
            _ => None,
        })
        .collect();

    let recorded: Vec<f64> = result.samples.iter().map(|s| s.mbps).collect();
    assert_eq!(reported, recorded);
}

#[tokio::test]
async fn test_closure_callback() {
    let base = start_server().await;
    let count = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&count);

    let client = SpeedTestClient::new(quick_config(&base))
        .unwrap()
        .with_callback(move |_event: ProgressEvent| {
            *counter.lock().unwrap() += 1;
        });

    client.measure_latency().await.unwrap();

    assert_eq!(*count.lock().unwrap(), 3, "One event per latency probe");
}

#[tokio::test]
async fn test_error_event_on_unreachable_server() {
    let callback = TestCallback::new();

    let client = SpeedTestClient::new(quick_config("http://127.0.0.1:1"))
        .unwrap()
        .with_callback(callback.clone());

    assert!(client.run().await.is_err());

    let events = callback.get_events();
    assert!(matches!(events.first(), Some(ProgressEvent::TestStarted)));
    assert!(
        matches!(events.last(), Some(ProgressEvent::Error(_))),
        "Run should end with an error event"
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::PhaseStarted { .. })));
}
