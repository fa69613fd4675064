//! Close signals and cancellation bridging.
//!
//! A [`CloseSignal`] is a one-shot broadcast: once fired it stays fired, and
//! every current or future observer sees it. [`cancel_when_closed`] ties such
//! a signal (or any other future) to a [`CancellationToken`] so that
//! background loops only need to watch a single token.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::trace;

// ============================================================================
// CloseSignal
// ============================================================================

/// One-shot broadcast fired when the owner is asked to shut down.
///
/// Cloning yields another handle to the same signal. It is never re-armed.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    /// Creates an unfired signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Returns `true` once the signal has fired.
    #[inline]
    #[must_use]
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired. Resolves immediately if it already has.
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Derives a token that is cancelled when `parent` is cancelled or `signal`
/// completes, whichever happens first.
///
/// The signal's output is ignored; only completion matters, so a
/// `oneshot::Receiver<T>` fires on send or on sender drop alike.
///
/// Spawns one waiter task that exits as soon as either source fires or the
/// derived token is cancelled. Dropping the returned [`DropGuard`] cancels
/// the derived token, which is the caller's manual early-cancel.
///
/// Must be called from within a tokio runtime.
pub fn cancel_when_closed<F>(parent: &CancellationToken, signal: F) -> (CancellationToken, DropGuard)
where
    F: Future + Send + 'static,
{
    let child = parent.child_token();
    let waiter = child.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = signal => trace!("Close signal observed"),
            () = waiter.cancelled() => {}
        }
        waiter.cancel();
    });

    let guard = child.clone().drop_guard();
    (child, guard)
}

// ============================================================================
// Tests
// ============================================================================
