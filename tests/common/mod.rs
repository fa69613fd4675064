//! Shared helpers for integration tests.

#![allow(dead_code)]

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use stream_shim::{Listener, MemoryListener, MemoryNetwork};
use tokio::io::{AsyncWriteExt, split};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing once per test binary. Honors `RUST_LOG`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stream_shim=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Binds a listener on an ephemeral port and echoes every connection.
pub async fn spawn_echo_server(network: &MemoryNetwork) -> anyhow::Result<String> {
    let listener: Listener<MemoryListener> = Listener::bind(network, "localhost:0").await?;
    let addr = listener.addr().to_string();

    tokio::spawn(async move {
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(error = %e, "Echo server stopped");
                    break;
                }
            };

            tokio::spawn(async move {
                let (mut rd, mut wr) = split(conn);
                if tokio::io::copy(&mut rd, &mut wr).await.is_ok() {
                    let _ = wr.shutdown().await;
                }
            });
        }
    });

    Ok(addr)
}
