//! Dial-side session pool.
//!
//! Keeps one established session per remote address and opens a fresh
//! stream on it for every dial. Concurrent dials to an address with no
//! session yet collapse into a single transport-level dial.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                Dialer                   │
//! │  ┌─────────────────────────────────┐    │
//! │  │ "10.0.0.1:443" → Session A      │    │
//! │  │ "10.0.0.2:443" → Session B      │    │
//! │  └─────────────────────────────────┘    │
//! │  in flight: "10.0.0.3:443" (N waiters)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Sessions are never evicted. If a cached session dies, later dials to
//! that address fail at stream-open and the caller decides what to do.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::singleflight::SingleFlight;

use super::{Session, StreamConn, Transport};

// ============================================================================
// Types
// ============================================================================

/// Result of one shared dial, cloned out to every waiter.
type DialOutcome<S> = std::result::Result<Arc<S>, Arc<IoError>>;

// ============================================================================
// Dialer
// ============================================================================

/// Opens logical connections over pooled transport sessions.
///
/// Cloning is cheap and every clone shares the same pool.
///
/// # Example
///
/// ```ignore
/// let dialer = Dialer::new(MemoryNetwork::new());
///
/// // First dial establishes the session, the second only opens a stream.
/// let first = dialer.dial("127.0.0.1:4433").await?;
/// let second = dialer.dial("127.0.0.1:4433").await?;
/// assert!(Arc::ptr_eq(first.session(), second.session()));
/// ```
pub struct Dialer<T: Transport> {
    inner: Arc<DialerInner<T>>,
}

/// State shared between dialer clones and in-flight dials.
struct DialerInner<T: Transport> {
    /// Underlying session transport.
    transport: T,

    /// Established sessions by address, exactly as the caller spelled it.
    sessions: RwLock<FxHashMap<String, Arc<T::Session>>>,

    /// Dials currently in progress.
    flights: SingleFlight<String, DialOutcome<T::Session>>,
}

impl<T: Transport> Clone for Dialer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ============================================================================
// Dialer - Constructor
// ============================================================================

impl<T: Transport> Dialer<T> {
    /// Creates a dialer with an empty pool.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(DialerInner {
                transport,
                sessions: RwLock::new(FxHashMap::default()),
                flights: SingleFlight::new(),
            }),
        }
    }
}

// ============================================================================
// Dialer - Public API
// ============================================================================

impl<T: Transport> Dialer<T> {
    /// Returns the underlying transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Returns the number of pooled sessions.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Returns the pooled session for `address`, if one exists.
    #[must_use]
    pub fn cached_session(&self, address: &str) -> Option<Arc<T::Session>> {
        self.inner.sessions.read().get(address).cloned()
    }

    /// Opens a logical connection to `address`.
    ///
    /// Sessions are pooled by `address` exactly as written, without
    /// resolving it. `localhost:4433` and `127.0.0.1:4433` therefore get
    /// separate sessions even when they reach the same peer.
    ///
    /// # Errors
    ///
    /// - [`Error::Dial`] if the session could not be established
    /// - [`Error::OpenStream`] if the stream could not be opened
    pub async fn dial(&self, address: &str) -> Result<StreamConn<T::Session>> {
        self.dial_with_cancel(address, &CancellationToken::new())
            .await
    }

    /// Opens a logical connection to `address`, giving up when `cancel` fires.
    ///
    /// Cancelling only abandons this call. The transport dial runs on its
    /// own task: it keeps going for any other callers, and when it succeeds
    /// its session is pooled even if nobody is left waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `cancel` fired first
    /// - [`Error::Dial`] if the session could not be established
    /// - [`Error::OpenStream`] if the stream could not be opened
    pub async fn dial_with_cancel(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamConn<T::Session>> {
        let session = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::cancelled("dial")),
            session = self.session(address) => session?,
        };

        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::cancelled("open stream")),
            stream = session.open_stream() => {
                stream.map_err(|e| Error::open_stream(address, e))?
            }
        };

        trace!(address, "Stream opened");
        Ok(StreamConn::new(session, stream))
    }
}

// ============================================================================
// Dialer - Session Resolution
// ============================================================================

impl<T: Transport> Dialer<T> {
    /// Returns the pooled session, establishing it through the flight group.
    async fn session(&self, address: &str) -> Result<Arc<T::Session>> {
        if let Some(session) = self.cached_session(address) {
            return Ok(session);
        }

        let inner = Arc::clone(&self.inner);
        let key = address.to_owned();

        self.inner
            .flights
            .run(key.clone(), move || async move { inner.establish(key).await })
            .await
            .map_err(|e| Error::dial(address, e))
    }
}

impl<T: Transport> DialerInner<T> {
    /// Dials `address` and stores the session on success.
    ///
    /// Runs at most once at a time per address.
    async fn establish(&self, address: String) -> DialOutcome<T::Session> {
        // A flight for this address may have finished just before ours began.
        let cached = self.sessions.read().get(&address).cloned();
        if let Some(session) = cached {
            return Ok(session);
        }

        match self.transport.dial(&address).await {
            Ok(session) => {
                let session = Arc::new(session);
                debug!(
                    address = %address,
                    remote = %session.remote_addr(),
                    "Session established"
                );
                self.sessions
                    .write()
                    .insert(address, Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                debug!(address = %address, error = %e, "Session dial failed");
                Err(Arc::new(e))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
