//! Stream Shim - single-stream connections over multiplexed sessions.
//!
//! This library adapts a multiplexed transport (QUIC-style: one session per
//! peer, many streams per session) into the familiar dial/listen model where
//! every connection is one byte stream.
//!
//! # Architecture
//!
//! - **Dial side**: [`Dialer`] keeps one session per address and opens a new
//!   stream for every dial. Concurrent dials to a cold address share a
//!   single transport dial.
//! - **Listen side**: [`Listener`] accepts sessions, accepts streams from all
//!   of them concurrently, and hands them out through one `accept`.
//! - **Connections**: [`StreamConn`] reads and writes its stream and reports
//!   the addresses of its session.
//!
//! The transport itself is pluggable through the [`Transport`],
//! [`SessionListener`] and [`Session`] traits. [`MemoryNetwork`] is an
//! in-process implementation.
//!
//! # Quick Start
//!
//! ```no_run
//! use stream_shim::{Dialer, Listener, MemoryNetwork, Result};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let network = MemoryNetwork::new();
//!     let listener = Listener::bind(&network, "localhost:0").await?;
//!     let addr = listener.addr().to_string();
//!
//!     tokio::spawn(async move {
//!         while let Ok(mut conn) = listener.accept().await {
//!             tokio::spawn(async move {
//!                 let (mut rd, mut wr) = tokio::io::split(&mut conn);
//!                 let _ = tokio::io::copy(&mut rd, &mut wr).await;
//!             });
//!         }
//!     });
//!
//!     let dialer = Dialer::new(network);
//!     let mut conn = dialer.dial(&addr).await?;
//!     conn.write_all(b"hello").await?;
//!     conn.shutdown().await?;
//!
//!     let mut echo = Vec::new();
//!     conn.read_to_end(&mut echo).await?;
//!     assert_eq!(echo, b"hello");
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cancel`] | Close signals and cancellation bridging |
//! | [`config`] | Listener options |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`singleflight`] | Keyed de-duplication of concurrent work |
//! | [`transport`] | Capability traits, dialer, listener, memory transport |

// ============================================================================
// Modules
// ============================================================================

/// Close signals and cancellation bridging.
pub mod cancel;

/// Listener configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Keyed de-duplication of concurrent work.
pub mod singleflight;

/// Session transport layer.
///
/// Capability traits plus the dial and listen sides built on them.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Cancellation
pub use cancel::{CloseSignal, cancel_when_closed};

// Configuration
pub use config::ListenerOptions;

// Error types
pub use error::{Error, Result};

// Transport types
pub use transport::{
    Dialer, Listener, ListenerState, MemoryConfig, MemoryListener, MemoryNetwork, MemorySession,
    Session, SessionListener, StreamConn, Transport,
};
