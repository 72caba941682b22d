use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;
use triomphe::Arc;

use crate::gate::Gate;

pub mod tcp;
#[cfg(unix)]
pub mod unix;

/// The transport listener a [GracefulListener](crate::GracefulListener) decorates.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Connection: Connection;
    type Addr: Debug + Clone + Send + 'static;

    /// Accept a new connection.
    ///
    /// Must be cancel safe: dropping the future before it resolves may not lose a connection.
    /// Once the listener is closed this has to fail, including for calls already pending.
    async fn accept(&self) -> io::Result<(Self::Connection, Self::Addr)>;

    /// Close the listener. Pending and future accepts fail afterwards.
    fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<Self::Addr>;
}

/// A live connection produced by a [Listener].
#[async_trait]
pub trait Connection: Send + 'static {
    /// Close the connection. An error of kind [io::ErrorKind::Interrupted] means the close did
    /// not happen and may be retried.
    async fn close(&mut self) -> io::Result<()>;
}

pub(crate) fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener is closed")
}

/// A socket that can be closed out from under pending accepts.
///
/// The tokio listeners only close on drop, which a shared `&self` can not do while an accept
/// borrows the socket. Accepts hold their own handle for the duration of one call and race it
/// against the `closed` gate.
pub(crate) struct ClosableSocket<T> {
    socket: Mutex<Option<Arc<T>>>,
    closed: Gate,
}

impl<T> ClosableSocket<T> {
    pub fn new(socket: T) -> Self {
        Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            closed: Gate::new(),
        }
    }

    /// Returns the socket and the gate released on close, or an error once closed.
    pub fn get(&self) -> io::Result<(Arc<T>, Gate)> {
        let socket = self.socket.lock().clone().ok_or_else(listener_closed)?;
        Ok((socket, self.closed.clone()))
    }

    pub fn close(&self) -> io::Result<()> {
        if self.socket.lock().take().is_none() {
            return Err(listener_closed());
        }
        self.closed.release();
        Ok(())
    }
}
