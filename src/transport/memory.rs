//! In-process multiplexed transport.
//!
//! [`MemoryNetwork`] behaves like a tiny network namespace: listeners bind
//! socket addresses, dialers reach them by address, and every session
//! carries any number of [`tokio::io::duplex`] streams. It has no framing,
//! encryption or flow control of its own.
//!
//! # Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let listener = Listener::bind(&network, "localhost:0").await?;
//! let dialer = Dialer::new(network.clone());
//! let conn = dialer.dial(&listener.addr().to_string()).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Session, SessionListener, Transport};

// ============================================================================
// Constants
// ============================================================================

/// First port handed out for port-0 binds and dialer-side addresses.
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Default per-direction buffer of each stream.
const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;

// ============================================================================
// MemoryConfig
// ============================================================================

/// Tuning for a [`MemoryNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Bytes buffered per stream direction before writes wait.
    pub stream_buffer: usize,

    /// Simulated handshake time of each dial.
    pub dial_latency: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stream_buffer: DEFAULT_STREAM_BUFFER,
            dial_latency: Duration::ZERO,
        }
    }
}

impl MemoryConfig {
    /// Sets the per-direction stream buffer.
    #[inline]
    #[must_use]
    pub fn with_stream_buffer(mut self, bytes: usize) -> Self {
        self.stream_buffer = bytes.max(1);
        self
    }

    /// Sets the simulated dial latency.
    #[inline]
    #[must_use]
    pub fn with_dial_latency(mut self, latency: Duration) -> Self {
        self.dial_latency = latency;
        self
    }
}

// ============================================================================
// MemoryNetwork
// ============================================================================

/// Shared registry of bound listeners.
struct NetworkInner {
    config: MemoryConfig,
    listeners: Mutex<FxHashMap<SocketAddr, mpsc::UnboundedSender<MemorySession>>>,
    next_port: AtomicU16,
    dial_attempts: AtomicUsize,
}

impl NetworkInner {
    /// Hands out the next non-zero port number.
    fn next_port(&self) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port != 0 {
                return port;
            }
            self.next_port.store(FIRST_EPHEMERAL_PORT, Ordering::Relaxed);
        }
    }
}

/// In-process network of sessions. Clones share the same namespace.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Creates an empty network with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Creates an empty network with the given settings.
    #[must_use]
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                config,
                listeners: Mutex::new(FxHashMap::default()),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
                dial_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns how many session dials have been attempted, failed ones included.
    #[inline]
    #[must_use]
    pub fn dial_attempts(&self) -> usize {
        self.inner.dial_attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of bound listeners.
    #[inline]
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    type Session = MemorySession;
    type Listener = MemoryListener;

    async fn dial(&self, address: &str) -> IoResult<MemorySession> {
        self.inner.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let remote = parse_address(address)?;

        if !self.inner.config.dial_latency.is_zero() {
            tokio::time::sleep(self.inner.config.dial_latency).await;
        }

        let acceptor = self
            .inner
            .listeners
            .lock()
            .get(&remote)
            .cloned()
            .ok_or_else(|| refused(remote))?;

        let local = SocketAddr::new(remote.ip(), self.inner.next_port());
        let (client, server) = MemorySession::pair(local, remote, self.inner.config.stream_buffer);

        acceptor.send(server).map_err(|_| refused(remote))?;

        debug!(%local, %remote, "Memory session established");
        Ok(client)
    }

    async fn listen(&self, address: &str) -> IoResult<MemoryListener> {
        let mut addr = parse_address(address)?;
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut listeners = self.inner.listeners.lock();

            if addr.port() == 0 {
                loop {
                    addr.set_port(self.inner.next_port());
                    if !listeners.contains_key(&addr) {
                        break;
                    }
                }
            } else if listeners.contains_key(&addr) {
                return Err(IoError::new(
                    ErrorKind::AddrInUse,
                    format!("address {addr} already bound"),
                ));
            }

            listeners.insert(addr, tx);
        }

        debug!(%addr, "Memory listener bound");

        Ok(MemoryListener {
            addr,
            incoming: AsyncMutex::new(rx),
            network: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// MemoryListener
// ============================================================================

/// Listener bound on a [`MemoryNetwork`].
pub struct MemoryListener {
    addr: SocketAddr,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<MemorySession>>,
    network: Arc<NetworkInner>,
    closed: AtomicBool,
}

impl MemoryListener {
    /// Removes the registry entry. Returns `false` if already released.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.network.listeners.lock().remove(&self.addr);
        true
    }
}

#[async_trait]
impl SessionListener for MemoryListener {
    type Session = MemorySession;

    async fn accept(&self) -> IoResult<MemorySession> {
        let mut incoming = self.incoming.lock().await;
        incoming
            .recv()
            .await
            .ok_or_else(|| IoError::new(ErrorKind::NotConnected, "listener closed"))
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        Ok(self.addr)
    }

    async fn close(&self) -> IoResult<()> {
        if !self.release() {
            return Err(IoError::new(
                ErrorKind::NotConnected,
                "listener already closed",
            ));
        }
        debug!(addr = %self.addr, "Memory listener closed");
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// MemorySession
// ============================================================================

/// One end of an in-memory session.
///
/// Both ends share one liveness token: closing or dropping either end
/// closes the session for both.
pub struct MemorySession {
    local: SocketAddr,
    remote: SocketAddr,
    /// Streams we open land in the peer's `incoming`.
    peer: mpsc::UnboundedSender<DuplexStream>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: CancellationToken,
    stream_buffer: usize,
}

impl MemorySession {
    /// Creates the (dialer, listener) ends of a new session.
    fn pair(local: SocketAddr, remote: SocketAddr, stream_buffer: usize) -> (Self, Self) {
        let closed = CancellationToken::new();
        let (to_server, server_incoming) = mpsc::unbounded_channel();
        let (to_client, client_incoming) = mpsc::unbounded_channel();

        let client = Self {
            local,
            remote,
            peer: to_server,
            incoming: AsyncMutex::new(client_incoming),
            closed: closed.clone(),
            stream_buffer,
        };
        let server = Self {
            local: remote,
            remote: local,
            peer: to_client,
            incoming: AsyncMutex::new(server_incoming),
            closed,
            stream_buffer,
        };

        (client, server)
    }

    /// Closes the session for both ends.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(local = %self.local, remote = %self.remote, "Memory session closed");
        }
        self.closed.cancel();
    }

    /// Returns `true` once either end closed the session.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Session for MemorySession {
    type Stream = DuplexStream;

    async fn open_stream(&self) -> IoResult<DuplexStream> {
        if self.closed.is_cancelled() {
            return Err(session_closed());
        }

        let (local, remote) = duplex(self.stream_buffer);
        self.peer.send(remote).map_err(|_| session_closed())?;

        trace!(remote = %self.remote, "Memory stream opened");
        Ok(local)
    }

    async fn accept_stream(&self) -> IoResult<DuplexStream> {
        let mut incoming = self.incoming.lock().await;

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(session_closed()),
            stream = incoming.recv() => stream.ok_or_else(session_closed),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parses `ip:port`, also accepting `localhost:port`.
fn parse_address(address: &str) -> IoResult<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let invalid = || {
        IoError::new(
            ErrorKind::InvalidInput,
            format!("invalid memory address: {address}"),
        )
    };

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;

    match host {
        "localhost" | "" => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
        _ => Err(invalid()),
    }
}

fn refused(remote: SocketAddr) -> IoError {
    IoError::new(
        ErrorKind::ConnectionRefused,
        format!("no listener at {remote}"),
    )
}

fn session_closed() -> IoError {
    IoError::new(ErrorKind::ConnectionAborted, "session closed")
}

// ============================================================================
// Tests
// ============================================================================
