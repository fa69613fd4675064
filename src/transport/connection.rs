//! Stream paired with its owning session.
//!
//! A [`StreamConn`] does its I/O on one stream and takes its addresses from
//! the session that carries the stream. Closing it closes the stream only.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::Session;

// ============================================================================
// StreamConn
// ============================================================================

/// One logical connection: a stream plus a shared handle to its session.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`], so it can be handed to
/// anything that expects a plain byte-stream connection.
pub struct StreamConn<S: Session> {
    /// Session carrying the stream. Shared with the pool or listener.
    session: Arc<S>,
    /// The stream, owned exclusively.
    stream: S::Stream,
}

impl<S: Session> StreamConn<S> {
    /// Pairs `stream` with the session it was opened or accepted on.
    pub(crate) fn new(session: Arc<S>, stream: S::Stream) -> Self {
        Self { session, stream }
    }

    /// Returns the session's local address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.session.local_addr()
    }

    /// Returns the session's remote address.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    /// Returns the session carrying this connection.
    #[inline]
    #[must_use]
    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// Splits the connection into its session and stream.
    #[must_use]
    pub fn into_parts(self) -> (Arc<S>, S::Stream) {
        (self.session, self.stream)
    }

    /// Shuts down the write side of the stream and drops it.
    ///
    /// The session is left open for other streams.
    ///
    /// # Errors
    ///
    /// Returns the stream's shutdown error.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl<S: Session> fmt::Debug for StreamConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConn")
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Byte Stream
// ============================================================================

impl<S: Session> AsyncRead for StreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: Session> AsyncWrite for StreamConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

// ============================================================================
// Tests
// ============================================================================
