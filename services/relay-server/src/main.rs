//! Relay server binary entry point
//!
//! Runs the standalone WebSocket signaling relay that broadcast and viewer
//! processes meet on.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (127.0.0.1:8787)
//! cargo run -p classcast-relay-server
//!
//! # Bind elsewhere and raise the per-session retention cap
//! cargo run -p classcast-relay-server -- \
//!   --bind 0.0.0.0:9000 \
//!   --retention 4096
//!
//! # Verbose logging
//! RUST_LOG=debug cargo run -p classcast-relay-server
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use classcast_relay_server::RelayServer;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Classcast signaling relay
///
/// Session-scoped publish/subscribe over WebSocket with at-least-once
/// delivery: unacked signals are retained and replayed to late subscribers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8787", env = "RELAY_BIND")]
    bind: String,

    /// Maximum unacked signals retained per session
    #[arg(long, default_value_t = 1024, env = "RELAY_RETENTION")]
    retention: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nShutdown signal received");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        // Give graceful shutdown a window before forcing the issue
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(3));
            eprintln!("Graceful shutdown timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })
    .expect("Failed to set Ctrl+C handler");

    // Create multi-threaded tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %args.bind,
        retention = args.retention,
        "Classcast relay starting"
    );

    let listener = TcpListener::bind(&args.bind).await?;
    info!("Listening on {}", listener.local_addr()?);

    let server = RelayServer::new(args.retention);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bridge the signal handler's flag into the accept loop
    tokio::spawn(async move {
        while !shutdown_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(listener, shutdown_rx).await;

    info!("Relay shut down gracefully");
    Ok(())
}

fn init_tracing() {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
