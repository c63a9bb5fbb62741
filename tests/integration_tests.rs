// Integration tests for the measurement server endpoints
// Each test binds its own server on an ephemeral port and drives it with reqwest

use futures::StreamExt;
use speedcheck::admission::AdmissionController;
use speedcheck::config::MIB;
use speedcheck::{Server, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

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
    // Give server time to start
    sleep(Duration::from_millis(100)).await;

    (format!("http://{}", addr), admission)
}

/// Reads a response body chunk by chunk and returns its length
async fn drain(response: reqwest::Response) -> u64 {
    let mut stream = response.bytes_stream();
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        total += chunk.unwrap().len() as u64;
    }
    total
}

/// Polls until no transfer request holds an admission slot
async fn wait_for_idle(admission: &AdmissionController) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if admission.inflight() == 0 {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_download_is_clamped_to_max_size() {
    let (base, _) = start_server(ServerConfig::new(0).with_max_download_mb(50)).await;

    let response = reqwest::get(format!("{}/transfer/download?size=999", base))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let headers = response.headers();
    assert_eq!(headers["content-length"], (50 * MIB).to_string().as_str());
    assert_eq!(headers["content-type"], "application/octet-stream");
    assert!(headers["cache-control"]
        .to_str()
        .unwrap()
        .contains("no-store"));
    assert_eq!(headers["pragma"], "no-cache");
    assert_eq!(headers["expires"], "0");

    assert_eq!(drain(response).await, 50 * MIB, "Body must be exactly the clamped size");
}

#[tokio::test]
async fn test_download_invalid_parameters_use_defaults() {
    let (base, _) = start_server(ServerConfig::new(0)).await;

    let response = reqwest::get(format!("{}/transfer/download?size=abc&chunk=1", base))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(drain(response).await, 5 * MIB);

    let response = reqwest::get(format!("{}/transfer/download", base))
        .await
        .unwrap();
    assert_eq!(drain(response).await, 5 * MIB);
}

#[tokio::test]
async fn test_download_payloads_differ() {
    let (base, _) = start_server(ServerConfig::new(0)).await;

    let first = reqwest::get(format!("{}/transfer/download?size=1", base))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let second = reqwest::get(format!("{}/transfer/download?size=1", base))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(first.len() as u64, MIB);
    assert_ne!(first, second, "Random payloads should not repeat");
}

#[tokio::test]
async fn test_ping() {
    let (base, _) = start_server(ServerConfig::new(0)).await;

    let body: serde_json::Value = reqwest::get(format!("{}/transfer/ping", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["server"], "ok");
    assert!(body["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_upload_success() {
    let (base, admission) = start_server(ServerConfig::new(0)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/transfer/upload", base))
        .body(vec![7u8; MIB as usize])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["receivedBytes"].as_u64().unwrap(), MIB);
    assert!(body["speedMbps"].as_f64().unwrap() >= 0.0);
    assert!(body["durationMs"].is_u64());

    assert!(wait_for_idle(&admission).await);
}

#[tokio::test]
async fn test_upload_over_limit_is_rejected() {
    let (base, admission) = start_server(ServerConfig::new(0).with_max_upload_mb(1)).await;

    let result = reqwest::Client::new()
        .post(format!("{}/transfer/upload", base))
        .body(vec![0u8; 3 * MIB as usize])
        .send()
        .await;

    // The server may close the connection before the client finishes sending
    if let Ok(response) = result {
        assert_eq!(response.status(), 413);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["limitBytes"].as_u64().unwrap(), MIB);
    }

    assert!(wait_for_idle(&admission).await, "Rejected upload must release its slot");
}

#[tokio::test]
async fn test_concurrent_uploads_within_ceiling() {
    let (base, _) = start_server(ServerConfig::new(0).with_max_upload_mb(50)).await;
    let client = reqwest::Client::new();

    let uploads: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            let url = format!("{}/transfer/upload", base);
            tokio::spawn(async move {
                client
                    .post(url)
                    .body(vec![1u8; 10 * 1_000_000])
                    .send()
                    .await
                    .unwrap()
                    .status()
            })
        })
        .collect();

    for upload in uploads {
        assert_eq!(upload.await.unwrap(), 200);
    }
}

#[tokio::test]
async fn test_overloaded_server_returns_503() {
    let (base, admission) =
        start_server(ServerConfig::new(0).with_max_inflight_requests(1)).await;

    let held = admission.try_admit().unwrap();

    let response = reqwest::get(format!("{}/transfer/download?size=1", base))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["retry-after"], "30");
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Service temporarily overloaded");
    assert_eq!(body["retryAfter"], 30);

    let response = reqwest::Client::new()
        .post(format!("{}/transfer/upload", base))
        .body(vec![0u8; 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    // Ping is never gated
    let response = reqwest::get(format!("{}/transfer/ping", base)).await.unwrap();
    assert_eq!(response.status(), 200);

    drop(held);
    let response = reqwest::get(format!("{}/transfer/download?size=1", base))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(drain(response).await, MIB);
}

#[tokio::test]
async fn test_inflight_returns_to_zero() {
    let (base, admission) = start_server(ServerConfig::new(0).with_max_upload_mb(1)).await;
    let client = reqwest::Client::new();
    let mut requests = Vec::new();

    // Completed downloads
    for _ in 0..3 {
        let client = client.clone();
        let url = format!("{}/transfer/download?size=2", base);
        requests.push(tokio::spawn(async move {
            let response = client.get(url).send().await.unwrap();
            assert_eq!(drain(response).await, 2 * MIB);
        }));
    }

    // Downloads abandoned after the first chunk
    for _ in 0..2 {
        let client = client.clone();
        let url = format!("{}/transfer/download?size=50", base);
        requests.push(tokio::spawn(async move {
            let response = client.get(url).send().await.unwrap();
            let mut stream = response.bytes_stream();
            assert!(stream.next().await.is_some());
        }));
    }

    // Rejected uploads
    for _ in 0..2 {
        let client = client.clone();
        let url = format!("{}/transfer/upload", base);
        requests.push(tokio::spawn(async move {
            let _ = client.post(url).body(vec![0u8; 2 * MIB as usize]).send().await;
        }));
    }

    // Accepted uploads
    for _ in 0..3 {
        let client = client.clone();
        let url = format!("{}/transfer/upload", base);
        requests.push(tokio::spawn(async move {
            let response = client.post(url).body(vec![0u8; 1024]).send().await.unwrap();
            assert_eq!(response.status(), 200);
        }));
    }

    for request in requests {
        request.await.unwrap();
    }

    assert!(
        wait_for_idle(&admission).await,
        "Inflight count stuck at {}",
        admission.inflight()
    );
}

#[tokio::test]
async fn test_info_reports_limits_and_stats() {
    let (base, admission) = start_server(
        ServerConfig::new(0)
            .with_max_download_mb(20)
            .with_max_upload_mb(10)
            .with_max_inflight_requests(7)
            .with_server_location("test-lab"),
    )
    .await;

    let response = reqwest::get(format!("{}/transfer/download?size=1", base))
        .await
        .unwrap();
    drain(response).await;
    assert!(wait_for_idle(&admission).await);

    let info: serde_json::Value = reqwest::get(format!("{}/transfer/info", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(info["location"], "test-lab");
    assert_eq!(info["maxDownloadSize"], 20);
    assert_eq!(info["maxUploadSize"], 10);
    assert_eq!(info["maxInflightRequests"], 7);
    assert_eq!(info["inflightRequests"], 0);
    assert_eq!(info["version"], speedcheck::VERSION);
    assert_eq!(info["stats"]["downloadBytes"].as_u64().unwrap(), MIB);
    assert_eq!(info["stats"]["downloadsCompleted"], 1);
}

#[tokio::test]
async fn test_health() {
    let (base, _) = start_server(ServerConfig::new(0)).await;

    let health: serde_json::Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "healthy");
    assert!(health["uptime"].as_f64().unwrap() >= 0.0);
    assert!(health["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let (base, _) = start_server(ServerConfig::new(0)).await;

    let response = reqwest::get(format!("{}/nope", base)).await.unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Endpoint not found");
}

#[tokio::test]
async fn test_cors_allows_any_origin_by_default() {
    let (base, _) = start_server(ServerConfig::new(0)).await;

    let response = reqwest::Client::new()
        .get(format!("{}/transfer/ping", base))
        .header("Origin", "http://example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn test_ping_batch() {
    let (base, _) = start_server(ServerConfig::new(0)).await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(format!("{}/transfer/ping-batch", base))
        .json(&serde_json::json!({ "count": 500 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 100);
    let measurements = body["measurements"].as_array().unwrap();
    assert_eq!(measurements.len(), 100);
    assert_eq!(measurements[0]["id"], 0);
    assert_eq!(measurements[0]["nonce"].as_str().unwrap().len(), 16);
    assert!(body["serverTime"].as_i64().unwrap() > 0);

    let body: serde_json::Value = client
        .post(format!("{}/transfer/ping-batch", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 10);

    let response = client
        .post(format!("{}/transfer/ping-batch", base))
        .json(&serde_json::json!({ "count": -4 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_connection_test_reports_client_ip() {
    let (base, _) = start_server(ServerConfig::new(0)).await;

    let body: serde_json::Value = reqwest::get(format!("{}/transfer/test", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["message"], "Connection successful");
    assert_eq!(body["clientIp"], "127.0.0.1");
    assert!(body["timestamp"].as_i64().unwrap() > 0);
}
