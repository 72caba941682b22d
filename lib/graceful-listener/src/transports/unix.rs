use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::SocketAddr;
use tokio::net::{UnixListener, UnixStream};
use tracing::info;

use super::{listener_closed, ClosableSocket, Connection, Listener};

/// A tokio [UnixListener] that can be closed while accepts are pending.
pub struct UnixTransport {
    socket: ClosableSocket<UnixListener>,
    local_addr: SocketAddr,
}

impl UnixTransport {
    /// Bind to `path`. Must be called from within a tokio runtime.
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let listener = UnixListener::bind(path.as_ref())?;
        info!("Binding unix listener to {}", path.as_ref().display());
        Self::from_listener(listener)
    }

    pub fn from_listener(listener: UnixListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            socket: ClosableSocket::new(listener),
            local_addr,
        })
    }
}

#[async_trait]
impl Listener for UnixTransport {
    type Connection = UnixStream;
    type Addr = SocketAddr;

    async fn accept(&self) -> io::Result<(UnixStream, SocketAddr)> {
        let (listener, closed) = self.socket.get()?;
        tokio::select! {
            res = listener.accept() => res,
            _ = closed.wait() => Err(listener_closed()),
        }
    }

    fn close(&self) -> io::Result<()> {
        self.socket.close()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr.clone())
    }
}

/// Shuts down the write half only, like the [TcpStream](tokio::net::TcpStream) impl.
#[async_trait]
impl Connection for UnixStream {
    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}
