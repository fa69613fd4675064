//! Keyed de-duplication of concurrent work.
//!
//! The first caller for a key starts the work; every caller that arrives
//! while it is still running awaits the same shared future and observes the
//! same result. The work runs on its own task, so it settles and the key is
//! forgotten even when every waiter gives up. A failed attempt is never
//! reused.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

// ============================================================================
// Types
// ============================================================================

/// Map of keys to the shared future doing their work.
type CallMap<K, T> = FxHashMap<K, Shared<BoxFuture<'static, T>>>;

// ============================================================================
// SingleFlight
// ============================================================================

/// Collapses concurrent calls with the same key into one execution.
///
/// The work is spawned onto the tokio runtime. A waiter that gives up early
/// only stops waiting; the work still runs to completion and releases its
/// key.
pub struct SingleFlight<K, T> {
    calls: Arc<Mutex<CallMap<K, T>>>,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` for `key`, or joins the execution already in flight.
    ///
    /// `work` is only invoked by the caller that starts a new execution.
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// Resumes the panic on every waiter if the work panics.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock();

            if let Some(call) = calls.get(&key) {
                trace!("Joining in-flight call");
                call.clone()
            } else {
                let settle = Settle {
                    calls: Arc::clone(&self.calls),
                    key: key.clone(),
                };
                let pending = work();

                // Spawned on first poll, after the table lock is released.
                let call = async move {
                    let task = tokio::spawn(async move {
                        let _settle = settle;
                        pending.await
                    });

                    match task.await {
                        Ok(output) => output,
                        Err(e) => std::panic::resume_unwind(e.into_panic()),
                    }
                }
                .boxed()
                .shared();

                calls.insert(key, call.clone());
                call
            }
        };

        call.await
    }

    /// Returns the number of keys with work in flight.
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

// ============================================================================
// Settle
// ============================================================================

/// Forgets a key once its work task ends, whether it returned or panicked.
struct Settle<K: Eq + Hash, T> {
    calls: Arc<Mutex<CallMap<K, T>>>,
    key: K,
}

impl<K: Eq + Hash, T> Drop for Settle<K, T> {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.key);
    }
}

// ============================================================================
// Tests
// ============================================================================
