use clap::{Parser, Subcommand};
use speedcheck::measurements::Quality;
use speedcheck::{
    ClientConfig, ProgressEvent, Server, ServerConfig, SpeedTestClient, TransferDirection,
};
use std::io::Write;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "speedcheck")]
#[command(about = "Adaptive network throughput, latency and jitter measurement", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the measurement server
    Server {
        /// Port to listen on
        #[arg(short, long, env = "PORT", default_value = "3000")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Largest download a request may ask for, in MB
        #[arg(long, env = "MAX_DOWNLOAD_SIZE_MB", default_value = "50")]
        max_download_mb: u64,

        /// Largest upload a request may carry, in MB
        #[arg(long, env = "MAX_UPLOAD_SIZE_MB", default_value = "50")]
        max_upload_mb: u64,

        /// Concurrent transfer requests before rejecting with 503
        #[arg(long, env = "MAX_INFLIGHT_REQUESTS", default_value = "100")]
        max_inflight: usize,

        /// Allowed CORS origins, `*` or a comma separated list
        #[arg(long, env = "CORS_ORIGIN", default_value = "*")]
        cors_origin: String,

        /// Location label reported by the info endpoint
        #[arg(long, env = "SERVER_LOCATION", default_value = "unknown")]
        location: String,
    },

    /// Run a measurement against a server
    Client {
        /// Server base URL
        #[arg(default_value = "http://127.0.0.1:3000")]
        url: String,

        /// Parallel streams per direction (1-8)
        #[arg(short = 'P', long, default_value = "4")]
        threads: usize,

        /// Maximum download phase duration in seconds; upload runs 2s shorter
        #[arg(short = 't', long, default_value = "8")]
        time: u64,

        /// Number of latency probes
        #[arg(long, default_value = "10")]
        pings: usize,

        /// Output the report in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            max_download_mb,
            max_upload_mb,
            max_inflight,
            cors_origin,
            location,
        } => {
            let mut config = ServerConfig::new(port)
                .with_max_download_mb(max_download_mb)
                .with_max_upload_mb(max_upload_mb)
                .with_max_inflight_requests(max_inflight)
                .with_cors_origin(cors_origin)
                .with_server_location(location);

            if let Some(addr) = bind {
                config = config.with_bind_addr(addr);
            }

            let server = Server::new(config);
            server.run().await?;
        }

        Commands::Client {
            url,
            threads,
            time,
            pings,
            json,
        } => {
            let config = ClientConfig::new(url)
                .with_threads(threads)
                .with_max_duration(Duration::from_secs(time))
                .with_latency_probes(pings, Duration::from_millis(100));

            let mut client = SpeedTestClient::new(config)?;
            if !json {
                client = client.with_callback(print_progress);
            }

            let cancel = client.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let report = client.run().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!();
                println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
                println!(
                    "Ping:     {:>8.2} ms  {} (jitter {:.2} ms {}, {} lost)",
                    report.latency.average_ms,
                    Quality::of_latency(report.latency.average_ms),
                    report.latency.jitter_ms,
                    Quality::of_jitter(report.latency.jitter_ms),
                    report.latency.failed_probes
                );
                for phase in [&report.download, &report.upload] {
                    let label = match phase.direction {
                        TransferDirection::Download => "Download:",
                        TransferDirection::Upload => "Upload:",
                    };
                    println!(
                        "{:<9} {:>8.2} Mbps  {} ({:?}, {:.2}s, stability {:.0}%)",
                        label,
                        phase.speed_mbps,
                        Quality::of_speed(phase.speed_mbps, phase.direction),
                        phase.stop_reason,
                        phase.duration.as_secs_f64(),
                        phase.stability
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_progress(event: ProgressEvent) {
    match event {
        ProgressEvent::PhaseStarted { direction, threads } => {
            println!("Measuring {} with {} streams...", direction, threads);
        }
        ProgressEvent::LiveThroughput {
            direction,
            elapsed,
            mbps,
            ..
        } => {
            print!(
                "\r  {:<8} {:>6.2}s {:>10.2} Mbps",
                direction,
                elapsed.as_secs_f64(),
                mbps
            );
            let _ = std::io::stdout().flush();
        }
        ProgressEvent::PhaseCompleted {
            direction,
            stop_reason,
            mbps,
            ..
        } => {
            println!();
            println!("  {} done: {:.2} Mbps ({:?})", direction, mbps, stop_reason);
        }
        ProgressEvent::Error(msg) => eprintln!("Error: {}", msg),
        _ => {}
    }
}
