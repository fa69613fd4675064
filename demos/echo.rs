//! Echo demo over the in-memory transport.
//!
//! Starts a listener, dials it a few times through one pooled session and
//! prints what comes back.
//!
//! Usage: `cargo run --example echo [-- --debug]`

// ============================================================================
// Imports
// ============================================================================

use stream_shim::{Dialer, Listener, MemoryNetwork};
use tokio::io::{AsyncReadExt, AsyncWriteExt, split};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const MESSAGES: &[&str] = &["hello, world!", "second stream", "third stream"];

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging.
fn init_logging(debug: bool) {
    let filter = if debug {
        "stream_shim=trace"
    } else {
        "stream_shim=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> stream_shim::Result<()> {
    let debug = std::env::args().any(|a| a == "--debug");
    init_logging(debug);

    let network = MemoryNetwork::new();
    let listener = Listener::bind(&network, "localhost:0").await?;
    let addr = listener.addr().to_string();
    println!("[Listen] {addr}");

    let server = tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            println!("[Accept] stream from {}", conn.remote_addr());
            tokio::spawn(async move {
                let (mut rd, mut wr) = split(conn);
                if tokio::io::copy(&mut rd, &mut wr).await.is_ok() {
                    let _ = wr.shutdown().await;
                }
            });
        }
    });

    let dialer = Dialer::new(network.clone());
    for message in MESSAGES {
        let mut conn = dialer.dial(&addr).await?;
        conn.write_all(message.as_bytes()).await?;
        conn.shutdown().await?;

        let mut echoed = String::new();
        conn.read_to_string(&mut echoed).await?;
        println!("[Echo] {echoed}");
    }

    println!(
        "[Pool] {} session(s), {} transport dial(s)",
        dialer.session_count(),
        network.dial_attempts()
    );

    server.abort();
    Ok(())
}
