//! Listener configuration.
//!
//! # Example
//!
//! ```ignore
//! use stream_shim::ListenerOptions;
//! use tokio_util::sync::CancellationToken;
//!
//! let shutdown = CancellationToken::new();
//! let options = ListenerOptions::new()
//!     .with_queue_capacity(4)
//!     .with_parent(shutdown.clone());
//! ```

// ============================================================================
// Imports
// ============================================================================

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Smallest queue a tokio channel allows; the closest thing to a rendezvous.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

// ============================================================================
// ListenerOptions
// ============================================================================

/// Options for [`Listener`](crate::Listener) construction.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Connections buffered between the per-session loops and `accept`.
    pub queue_capacity: usize,

    /// Parent cancellation token. Cancelling it stops every background loop
    /// of the listener, exactly like `close` does for intake.
    pub parent: Option<CancellationToken>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ListenerOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            parent: None,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ListenerOptions {
    /// Sets the accept queue capacity.
    #[inline]
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the parent cancellation token.
    #[inline]
    #[must_use]
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Checks the options before a listener is built.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the queue capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::config(
                "queue capacity must be at least 1. Use .with_queue_capacity(1) for a rendezvous queue.",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
