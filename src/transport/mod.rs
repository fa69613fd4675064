//! Session transport layer.
//!
//! This module adapts a multiplexed transport (one session per peer, many
//! streams per session) into single-stream connections.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                              ┌──────────────────┐
//! │  Dialer          │          Session             │  Listener        │
//! │  addr → Session  │◄────────────────────────────►│  session loop    │
//! │  open_stream()   │   stream 1, stream 2, ...    │  └ stream loops  │
//! │  → StreamConn    │                              │    → accept()    │
//! └──────────────────┘                              └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Dialer::dial` - Reuse or establish the session, open one stream
//! 2. `Listener::accept` - Take the next stream from any accepted session
//! 3. `StreamConn` - Read/write; addresses come from the session
//! 4. `StreamConn::close` - Close the stream, the session stays up
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Stream paired with its session |
//! | `pool` | Dial side with a per-address session cache |
//! | `server` | Listen side fanning streams into one queue |
//! | `memory` | In-process transport |

// ============================================================================
// Submodules
// ============================================================================

/// Stream paired with its owning session.
pub mod connection;

/// In-process multiplexed transport.
pub mod memory;

/// Dial-side session pool.
pub mod pool;

/// Listen-side session multiplexer.
pub mod server;

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::StreamConn;
pub use memory::{MemoryConfig, MemoryListener, MemoryNetwork, MemorySession};
pub use pool::Dialer;
pub use server::{Listener, ListenerState};

// ============================================================================
// Capability Traits
// ============================================================================

/// A transport able to establish and accept sessions.
///
/// Security and protocol configuration live in the implementing value.
/// Cancelling a call means dropping its future.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Established session type.
    type Session: Session;

    /// Bound listener type.
    type Listener: SessionListener<Session = Self::Session>;

    /// Establishes a session with the peer at `address`.
    async fn dial(&self, address: &str) -> io::Result<Self::Session>;

    /// Binds a listener for incoming sessions at `address`.
    async fn listen(&self, address: &str) -> io::Result<Self::Listener>;
}

/// A bound listener producing incoming sessions.
#[async_trait]
pub trait SessionListener: Send + Sync + 'static {
    /// Session type produced by this listener.
    type Session: Session;

    /// Waits for the next incoming session.
    async fn accept(&self) -> io::Result<Self::Session>;

    /// Returns the bound local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Releases the bound address.
    async fn close(&self) -> io::Result<()>;
}

/// An established connection to one peer carrying many streams.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Bidirectional byte stream multiplexed inside the session.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a new outgoing stream.
    async fn open_stream(&self) -> io::Result<Self::Stream>;

    /// Waits for the peer to open a stream.
    async fn accept_stream(&self) -> io::Result<Self::Stream>;

    /// Local address of the session.
    fn local_addr(&self) -> SocketAddr;

    /// Remote address of the session.
    fn remote_addr(&self) -> SocketAddr;

    /// Resolves once the session is closed.
    async fn closed(&self);
}
