//! Listen-side session multiplexer.
//!
//! Accepts transport sessions, then accepts streams from every session
//! concurrently and funnels them into a single accept queue.
//!
//! # Accept Flow
//!
//! 1. `Listener::bind` binds the transport listener and spawns the session loop
//! 2. The session loop accepts sessions and spawns one stream loop per session
//! 3. Each stream loop wraps accepted streams into [`StreamConn`]s and queues them
//! 4. `Listener::accept` drains the queue until the listener is closed
//!
//! Streams from one session reach the queue in the order they were accepted.
//! Nothing is ordered across sessions.
//!
//! Every background loop watches one cancellation token, derived from the
//! parent token and the listener's close signal. Stream loops also watch
//! their session's liveness, and every queue push races those signals so a
//! loop never waits on a consumer that is gone.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use crate::cancel::{CloseSignal, cancel_when_closed};
use crate::config::ListenerOptions;
use crate::error::{Error, Result};

use super::{Session, SessionListener, StreamConn, Transport};

// ============================================================================
// Types
// ============================================================================

/// Sending half of the accept queue.
type ConnSender<S> = mpsc::Sender<StreamConn<S>>;

/// Error that ended the session loop, if any.
type LoopFailure = Arc<Mutex<Option<Arc<IoError>>>>;

// ============================================================================
// ListenerState
// ============================================================================

/// Lifecycle of a [`Listener`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Accepting sessions and streams.
    Running,
    /// Close requested, close signal fired.
    Closing,
    /// Underlying listener released.
    Closed,
}

// ============================================================================
// Listener
// ============================================================================

/// Accepts logical connections from every session of a transport listener.
///
/// # Example
///
/// ```ignore
/// let network = MemoryNetwork::new();
/// let listener = Listener::bind(&network, "localhost:0").await?;
///
/// loop {
///     let conn = match listener.accept().await {
///         Ok(conn) => conn,
///         Err(e) if e.is_closed() => break,
///         Err(e) => return Err(e),
///     };
///     tokio::spawn(serve(conn));
/// }
/// ```
pub struct Listener<L: SessionListener> {
    /// Bound transport listener, shared with the session loop.
    inner: Arc<L>,

    /// Address the transport listener is bound to.
    local_addr: SocketAddr,

    /// Fired by `close`.
    close: CloseSignal,

    /// Token every background loop watches.
    shutdown: CancellationToken,

    /// Receiving half of the accept queue.
    incoming: AsyncMutex<mpsc::Receiver<StreamConn<L::Session>>>,

    /// Error that stopped session intake.
    failure: LoopFailure,

    /// Lifecycle state.
    state: Mutex<ListenerState>,

    /// Cancels `shutdown` when the listener is dropped.
    _shutdown_guard: DropGuard,
}

// ============================================================================
// Listener - Constructors
// ============================================================================

impl<L: SessionListener> Listener<L> {
    /// Binds `address` on `transport` and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the transport cannot bind.
    pub async fn bind<T>(transport: &T, address: &str) -> Result<Self>
    where
        T: Transport<Listener = L>,
    {
        Self::bind_with_options(transport, address, ListenerOptions::default()).await
    }

    /// Binds `address` on `transport` with custom options.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options are invalid
    /// - [`Error::Bind`] if the transport cannot bind
    pub async fn bind_with_options<T>(
        transport: &T,
        address: &str,
        options: ListenerOptions,
    ) -> Result<Self>
    where
        T: Transport<Listener = L>,
    {
        options.validate()?;

        let listener = transport
            .listen(address)
            .await
            .map_err(|e| Error::bind(address, e))?;

        Self::from_session_listener(listener, options)
    }

    /// Wraps an already bound transport listener and starts accepting.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options are invalid
    /// - [`Error::Io`] if the listener cannot report its address
    pub fn from_session_listener(listener: L, options: ListenerOptions) -> Result<Self> {
        options.validate()?;

        let local_addr = listener.local_addr()?;
        let inner = Arc::new(listener);
        let close = CloseSignal::new();
        let parent = options.parent.unwrap_or_default();

        let close_observer = close.clone();
        let (shutdown, shutdown_guard) =
            cancel_when_closed(&parent, async move { close_observer.fired().await });

        let (tx, rx) = mpsc::channel(options.queue_capacity);
        let failure = LoopFailure::default();

        tokio::spawn(accept_sessions(
            Arc::clone(&inner),
            tx,
            shutdown.clone(),
            Arc::clone(&failure),
        ));

        info!(addr = %local_addr, "Listener started");

        Ok(Self {
            inner,
            local_addr,
            close,
            shutdown,
            incoming: AsyncMutex::new(rx),
            failure,
            state: Mutex::new(ListenerState::Running),
            _shutdown_guard: shutdown_guard,
        })
    }
}

// ============================================================================
// Listener - Public API
// ============================================================================

impl<L: SessionListener> Listener<L> {
    /// Returns the bound local address.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// Waits for the next logical connection from any session.
    ///
    /// Concurrent callers each receive a different connection.
    ///
    /// # Errors
    ///
    /// - [`Error::ListenerClosed`] once `close` has been called, including
    ///   for calls already waiting when it happens
    /// - [`Error::AcceptSession`] if session intake died and no
    ///   connections are left to hand out
    pub async fn accept(&self) -> Result<StreamConn<L::Session>> {
        if !self.close.is_fired() {
            tokio::select! {
                biased;
                () = self.close.fired() => {}
                conn = self.next_queued() => return conn,
            }
        }

        self.discard_queued();
        Err(Error::ListenerClosed)
    }

    /// Closes the listener.
    ///
    /// Fires the close signal, which stops every background loop and wakes
    /// every pending `accept`, then closes the transport listener. Connections
    /// still queued are dropped, so their peers see the stream end. Later
    /// calls return `Ok(())` without touching the transport again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Close`] if the transport listener fails to close.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ListenerState::Running {
                debug!(addr = %self.local_addr, "Listener already closed");
                return Ok(());
            }
            *state = ListenerState::Closing;
        }

        self.close.fire();
        self.discard_queued();
        let result = self.inner.close().await;
        *self.state.lock() = ListenerState::Closed;

        info!(addr = %self.local_addr, "Listener closed");
        result.map_err(Error::close)
    }
}

// ============================================================================
// Listener - Queue
// ============================================================================

impl<L: SessionListener> Listener<L> {
    /// Takes the next queued connection.
    async fn next_queued(&self) -> Result<StreamConn<L::Session>> {
        let mut incoming = self.incoming.lock().await;

        match incoming.recv().await {
            Some(conn) => {
                trace!(remote = %conn.remote_addr(), "Connection accepted");
                Ok(conn)
            }
            // Every loop has exited and the queue is drained.
            None => Err(self.exhausted()),
        }
    }

    /// Closes the accept queue and drops whatever is still in it.
    ///
    /// Skipped while another `accept` holds the queue; that call runs this
    /// again on its way out.
    fn discard_queued(&self) {
        let Ok(mut incoming) = self.incoming.try_lock() else {
            return;
        };

        incoming.close();
        while let Ok(conn) = incoming.try_recv() {
            debug!(remote = %conn.remote_addr(), "Dropping queued connection");
        }
    }

    /// Error for an accept queue that will never yield again.
    fn exhausted(&self) -> Error {
        if self.shutdown.is_cancelled() {
            return Error::ListenerClosed;
        }
        match self.failure.lock().clone() {
            Some(source) => Error::accept_session(source),
            None => Error::ListenerClosed,
        }
    }
}

impl<L: SessionListener> std::fmt::Debug for Listener<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Background Loops
// ============================================================================

/// Accepts sessions and spawns a stream loop for each.
///
/// Ends when `shutdown` fires or the transport fails to accept. Stream
/// loops already running keep going either way.
async fn accept_sessions<L: SessionListener>(
    listener: Arc<L>,
    queue: ConnSender<L::Session>,
    shutdown: CancellationToken,
    failure: LoopFailure,
) {
    debug!("Session loop started");

    loop {
        let session = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(session) => Arc::new(session),
                Err(e) => {
                    if !shutdown.is_cancelled() {
                        warn!(error = %e, "Session accept failed");
                        *failure.lock() = Some(Arc::new(e));
                    }
                    break;
                }
            },
        };

        debug!(remote = %session.remote_addr(), "Session accepted");
        tokio::spawn(accept_streams(session, queue.clone(), shutdown.clone()));
    }

    debug!("Session loop terminated");
}

/// Accepts streams from one session and queues them in order.
///
/// Ends when `shutdown` fires, the session closes, the transport fails to
/// accept, or the queue is gone.
async fn accept_streams<S: Session>(
    session: Arc<S>,
    queue: ConnSender<S>,
    shutdown: CancellationToken,
) {
    let remote = session.remote_addr();

    loop {
        let stream = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = session.closed() => break,
            accepted = session.accept_stream() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%remote, error = %e, "Stream accept failed");
                    break;
                }
            },
        };

        let conn = StreamConn::new(Arc::clone(&session), stream);

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = session.closed() => break,
            sent = queue.send(conn) => {
                if sent.is_err() {
                    break;
                }
            }
        }

        trace!(%remote, "Stream queued");
    }

    debug!(%remote, "Stream loop terminated");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use crate::transport::{MemoryListener, MemoryNetwork, MemorySession};

    const WAIT: Duration = Duration::from_secs(1);

    async fn listener(network: &MemoryNetwork) -> Listener<MemoryListener> {
        Listener::bind(network, "127.0.0.1:0").await.expect("bind")
    }

    /// Opens a stream on `session` and tags it with one byte.
    async fn open_tagged(session: &MemorySession, tag: u8) {
        let mut stream = session.open_stream().await.expect("open");
        stream.write_all(&[tag]).await.expect("tag");
        // Stream must outlive the read on the accepting side.
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });
    }

    async fn read_tag(conn: &mut StreamConn<MemorySession>) -> u8 {
        let mut tag = [0u8; 1];
        conn.read_exact(&mut tag).await.expect("read tag");
        tag[0]
    }

    #[tokio::test]
    async fn test_bind_reports_addr() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;

        assert!(listener.addr().port() > 0);
        assert_eq!(listener.state(), ListenerState::Running);
    }

    #[tokio::test]
    async fn test_bind_error_is_wrapped() {
        let network = MemoryNetwork::new();
        let _held = network.listen("127.0.0.1:7200").await.expect("listen");

        let err = Listener::bind(&network, "127.0.0.1:7200").await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_zero_queue_rejected() {
        let network = MemoryNetwork::new();
        let options = ListenerOptions::new().with_queue_capacity(0);

        let err = Listener::bind_with_options(&network, "127.0.0.1:0", options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(network.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_streams_from_one_session_keep_order() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;
        let session = network
            .dial(&listener.addr().to_string())
            .await
            .expect("dial");

        for tag in 1..=3 {
            open_tagged(&session, tag).await;
        }

        let mut tags = Vec::new();
        for _ in 0..3 {
            let mut conn = listener.accept().await.expect("accept");
            tags.push(read_tag(&mut conn).await);
        }
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_streams_from_many_sessions_all_arrive() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;
        let addr = listener.addr().to_string();

        let a = network.dial(&addr).await.expect("dial a");
        let b = network.dial(&addr).await.expect("dial b");
        open_tagged(&a, 10).await;
        open_tagged(&b, 20).await;
        open_tagged(&a, 11).await;

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..3 {
            let mut conn = timeout(WAIT, listener.accept())
                .await
                .expect("accept in time")
                .expect("accept");
            let tag = read_tag(&mut conn).await;
            if conn.remote_addr() == a.local_addr() {
                from_a.push(tag);
            } else {
                from_b.push(tag);
            }
        }

        assert_eq!(from_a, vec![10, 11]);
        assert_eq!(from_b, vec![20]);
    }

    #[tokio::test]
    async fn test_addresses_come_from_session() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;
        let session = network
            .dial(&listener.addr().to_string())
            .await
            .expect("dial");
        open_tagged(&session, 1).await;

        let conn = listener.accept().await.expect("accept");
        assert_eq!(conn.local_addr(), listener.addr());
        assert_eq!(conn.remote_addr(), session.local_addr());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;

        let mut pending = tokio_test::task::spawn(listener.accept());
        tokio_test::assert_pending!(pending.poll());

        listener.close().await.expect("close");

        assert!(pending.is_woken());
        let err = tokio_test::assert_ready_err!(pending.poll());
        assert!(err.is_closed());
        assert_eq!(listener.state(), ListenerState::Closed);
    }

    #[tokio::test]
    async fn test_nothing_delivered_after_close() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;
        let session = network
            .dial(&listener.addr().to_string())
            .await
            .expect("dial");
        open_tagged(&session, 1).await;
        tokio::task::yield_now().await;

        listener.close().await.expect("close");

        for _ in 0..3 {
            assert!(listener.accept().await.unwrap_err().is_closed());
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;

        listener.close().await.expect("first close");
        listener.close().await.expect("second close is a no-op");
        assert_eq!(network.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_intake() {
        let network = MemoryNetwork::new();
        let parent = CancellationToken::new();
        let options = ListenerOptions::new().with_parent(parent.clone());
        let listener = Listener::bind_with_options(&network, "127.0.0.1:0", options)
            .await
            .expect("bind");

        parent.cancel();

        let err = timeout(WAIT, listener.accept())
            .await
            .expect("accept unblocks")
            .unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_failed_session_does_not_affect_others() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;
        let addr = listener.addr().to_string();

        let a = network.dial(&addr).await.expect("dial a");
        let b = network.dial(&addr).await.expect("dial b");

        open_tagged(&b, 20).await;
        let mut first = timeout(WAIT, listener.accept())
            .await
            .expect("accept in time")
            .expect("accept");
        assert_eq!(read_tag(&mut first).await, 20);

        a.close();
        tokio::task::yield_now().await;

        open_tagged(&b, 21).await;
        let mut second = timeout(WAIT, listener.accept())
            .await
            .expect("accept in time")
            .expect("accept");
        assert_eq!(read_tag(&mut second).await, 21);
    }

    /// Listener whose session intake fails right away.
    struct BrokenListener;

    #[async_trait]
    impl SessionListener for BrokenListener {
        type Session = MemorySession;

        async fn accept(&self) -> std::io::Result<MemorySession> {
            Err(IoError::new(ErrorKind::ConnectionReset, "endpoint gone"))
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 1)))
        }

        async fn close(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_session_intake_failure_surfaces_on_accept() {
        let listener = Listener::from_session_listener(BrokenListener, ListenerOptions::new())
            .expect("wrap listener");

        let err = timeout(WAIT, listener.accept())
            .await
            .expect("accept unblocks")
            .unwrap_err();

        assert!(matches!(err, Error::AcceptSession { .. }));
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
    }

    /// Hands out one session from a memory listener, then fails.
    struct FlakyListener {
        inner: MemoryListener,
        served: Mutex<bool>,
    }

    #[async_trait]
    impl SessionListener for FlakyListener {
        type Session = MemorySession;

        async fn accept(&self) -> std::io::Result<MemorySession> {
            if std::mem::replace(&mut *self.served.lock(), true) {
                return Err(IoError::new(ErrorKind::ConnectionReset, "endpoint gone"));
            }
            self.inner.accept().await
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            self.inner.local_addr()
        }

        async fn close(&self) -> std::io::Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_stream_loops_outlive_session_intake() {
        let network = MemoryNetwork::new();
        let flaky = FlakyListener {
            inner: network.listen("127.0.0.1:0").await.expect("listen"),
            served: Mutex::new(false),
        };
        let listener =
            Listener::from_session_listener(flaky, ListenerOptions::new()).expect("wrap listener");
        let session = network
            .dial(&listener.addr().to_string())
            .await
            .expect("dial");

        timeout(WAIT, async {
            while listener.failure.lock().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session intake fails");

        open_tagged(&session, 7).await;
        let mut conn = timeout(WAIT, listener.accept())
            .await
            .expect("accept in time")
            .expect("accept after intake failure");
        assert_eq!(read_tag(&mut conn).await, 7);

        session.close();
        let err = timeout(WAIT, listener.accept())
            .await
            .expect("accept unblocks")
            .unwrap_err();
        assert!(matches!(err, Error::AcceptSession { .. }));
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_close_drops_queued_connections() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;
        let session = network
            .dial(&listener.addr().to_string())
            .await
            .expect("dial");
        let mut stream = session.open_stream().await.expect("open");

        timeout(WAIT, async {
            while listener
                .incoming
                .try_lock()
                .map_or(true, |incoming| incoming.is_empty())
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection queued");

        listener.close().await.expect("close");

        let mut rest = Vec::new();
        let read = timeout(WAIT, stream.read_to_end(&mut rest))
            .await
            .expect("peer sees end of stream")
            .expect("read");
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_drop_stops_background_loops() {
        let network = MemoryNetwork::new();
        let listener = listener(&network).await;
        let session = network
            .dial(&listener.addr().to_string())
            .await
            .expect("dial");
        tokio::task::yield_now().await;

        drop(listener);

        // Stream loop held the server end; once it exits the session closes.
        timeout(WAIT, session.closed())
            .await
            .expect("server end released");
        timeout(WAIT, async {
            while network.listener_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("address released");
    }
}
