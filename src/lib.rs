//! speedcheck - adaptive network throughput, latency and jitter measurement
//!
//! The server streams random data, accepts uploads and answers latency probes
//! over HTTP. The client measures latency, then runs parallel download and
//! upload phases that stop early once the throughput samples converge.
//!
//! # Features
//!
//! - Backpressured random download streams with an inflight request gate
//! - Upload ceiling enforcement
//! - Multi-stream phases with variance-based early termination
//! - Latency and jitter from sequential probes
//! - Real-time progress callbacks and a JSON report
//! - Asynchronous I/O using tokio
//!
//! # Examples
//!
//! ```no_run
//! use speedcheck::{ClientConfig, Server, ServerConfig, SpeedTestClient};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! tokio::spawn(async {
//!     Server::new(ServerConfig::new(3000)).run().await
//! });
//!
//! let client = SpeedTestClient::new(ClientConfig::new("http://127.0.0.1:3000"))?;
//! let report = client.run().await?;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod generator;
pub mod latency;
pub mod measurements;
pub mod orchestrator;
pub mod server;
pub mod stability;
pub mod transport;
pub mod upload;

pub use client::{ProgressCallback, ProgressEvent, SpeedTestClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use measurements::{LatencyResult, PhaseResult, SpeedTestReport, StopReason, TransferDirection};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
