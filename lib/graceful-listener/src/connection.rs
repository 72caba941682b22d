use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;
use triomphe::Arc;

use crate::transports::Connection;
use crate::waiter::CountdownWaiter;

/// A connection accepted through a [GracefulListener](crate::GracefulListener).
///
/// The connection counts as live until its first completed close, at which point the listener's
/// drain is notified exactly once. Dropping a connection that was never closed notifies as well.
pub struct GracefulConnection<C> {
    inner: C,
    /// Taken on the first report so it can never fire twice.
    waiter: Option<Arc<CountdownWaiter>>,
}

impl<C> GracefulConnection<C> {
    /// Wrap `inner` as one live unit of `waiter`. The caller must already have added it.
    pub(crate) fn new(inner: C, waiter: Arc<CountdownWaiter>) -> Self {
        Self {
            inner,
            waiter: Some(waiter),
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    /// Returns true once the listener has been told this connection is finished.
    pub fn is_finished(&self) -> bool {
        self.waiter.is_none()
    }

    fn report_finished(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.done();
        }
    }
}

impl<C: Connection> GracefulConnection<C> {
    /// Close the underlying connection and return its result unchanged.
    ///
    /// An [io::ErrorKind::Interrupted] result leaves the connection live so the close can be
    /// retried. Only the timeout of a graceful shutdown bounds a close that keeps being
    /// interrupted.
    pub async fn close(&mut self) -> io::Result<()> {
        let result = self.inner.close().await;
        match &result {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("connection close was interrupted, not reporting it as finished");
            },
            _ => self.report_finished(),
        }
        result
    }
}

/// Lets a graceful listener be used, or wrapped again, wherever a [Listener](crate::Listener) is
/// expected.
#[async_trait]
impl<C: Connection> Connection for GracefulConnection<C> {
    async fn close(&mut self) -> io::Result<()> {
        GracefulConnection::close(self).await
    }
}

impl<C: fmt::Debug> fmt::Debug for GracefulConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulConnection")
            .field("inner", &self.inner)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<C> Drop for GracefulConnection<C> {
    fn drop(&mut self) {
        self.report_finished();
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for GracefulConnection<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for GracefulConnection<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
