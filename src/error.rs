//! Error types for the stream shim.
//!
//! Every failure is tagged with the operation (and, where there is one, the
//! address) that produced it, then handed to the nearest caller. Nothing in
//! this crate retries on its own.
//!
//! # Usage
//!
//! ```ignore
//! use stream_shim::{Error, Result};
//!
//! async fn example(listener: &Listener<MemoryListener>) -> Result<()> {
//!     match listener.accept().await {
//!         Ok(conn) => handle(conn),
//!         Err(Error::ListenerClosed) => return Ok(()),
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Establishment | [`Error::Bind`], [`Error::Dial`] |
//! | Stream | [`Error::OpenStream`], [`Error::AcceptSession`] |
//! | Lifecycle | [`Error::ListenerClosed`], [`Error::Close`], [`Error::Cancelled`] |
//! | External | [`Error::Io`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::{Error as IoError, ErrorKind};
use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid dialer or listener configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Establishment Errors
    // ========================================================================
    /// The transport could not bind a session listener.
    #[error("Bind to {address} failed: {source}")]
    Bind {
        /// Address that was requested.
        address: String,
        /// Transport error.
        source: IoError,
    },

    /// The transport could not establish a session.
    ///
    /// Every caller that joined the same in-flight dial receives a clone of
    /// the same underlying error.
    #[error("Dial to {address} failed: {source}")]
    Dial {
        /// Address that was dialed.
        address: String,
        /// Transport error, shared between all waiters.
        source: Arc<IoError>,
    },

    // ========================================================================
    // Stream Errors
    // ========================================================================
    /// Opening a stream on an established session failed.
    ///
    /// The session stays cached; only this call fails.
    #[error("Open stream to {address} failed: {source}")]
    OpenStream {
        /// Remote address of the session.
        address: String,
        /// Transport error.
        source: IoError,
    },

    /// The listener stopped taking sessions because of a transport error
    /// and every connection it produced has been handed out.
    #[error("Accept session failed: {source}")]
    AcceptSession {
        /// Error that ended the session-accept loop.
        source: Arc<IoError>,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The listener has been closed.
    #[error("Listener closed")]
    ListenerClosed,

    /// Closing the underlying session listener failed.
    #[error("Close failed: {source}")]
    Close {
        /// Transport error.
        source: IoError,
    },

    /// The caller's cancellation token fired first.
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was abandoned.
        operation: &'static str,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a bind error.
    #[inline]
    pub fn bind(address: impl Into<String>, source: IoError) -> Self {
        Self::Bind {
            address: address.into(),
            source,
        }
    }

    /// Creates a dial error from a shared transport error.
    #[inline]
    pub fn dial(address: impl Into<String>, source: Arc<IoError>) -> Self {
        Self::Dial {
            address: address.into(),
            source,
        }
    }

    /// Creates an open-stream error.
    #[inline]
    pub fn open_stream(address: impl Into<String>, source: IoError) -> Self {
        Self::OpenStream {
            address: address.into(),
            source,
        }
    }

    /// Creates an accept-session error.
    #[inline]
    pub fn accept_session(source: Arc<IoError>) -> Self {
        Self::AcceptSession { source }
    }

    /// Creates a close error.
    #[inline]
    pub fn close(source: IoError) -> Self {
        Self::Close { source }
    }

    /// Creates a cancellation error.
    #[inline]
    pub fn cancelled(operation: &'static str) -> Self {
        Self::Cancelled { operation }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the listener was closed.
    ///
    /// Use this to tell "shutting down" apart from "transport broke".
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ListenerClosed)
    }

    /// Returns `true` if the caller cancelled the operation.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if session establishment failed.
    #[inline]
    #[must_use]
    pub fn is_dial_error(&self) -> bool {
        matches!(self, Self::Dial { .. })
    }

    /// Returns the [`ErrorKind`] of the underlying transport error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::InvalidInput,
            Self::Bind { source, .. }
            | Self::OpenStream { source, .. }
            | Self::Close { source }
            | Self::Io(source) => source.kind(),
            Self::Dial { source, .. } | Self::AcceptSession { source } => source.kind(),
            Self::ListenerClosed => ErrorKind::NotConnected,
            Self::Cancelled { .. } => ErrorKind::Interrupted,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<Error> for IoError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(source) => source,
            other => IoError::new(other.kind(), other),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
