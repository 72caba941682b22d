use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::info;

use super::{listener_closed, ClosableSocket, Connection, Listener};

/// A tokio [TcpListener] that can be closed while accepts are pending.
pub struct TcpTransport {
    socket: ClosableSocket<TcpListener>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let transport = Self::from_listener(listener)?;
        info!("Binding TCP listener to {}", transport.local_addr);
        Ok(transport)
    }

    pub fn from_listener(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            socket: ClosableSocket::new(listener),
            local_addr,
        })
    }
}

#[async_trait]
impl Listener for TcpTransport {
    type Connection = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (listener, closed) = self.socket.get()?;
        tokio::select! {
            res = listener.accept() => res,
            _ = closed.wait() => Err(listener_closed()),
        }
    }

    fn close(&self) -> io::Result<()> {
        self.socket.close()
    }

    /// The bound address. Still available after close.
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Shuts down the write half, so the peer reads end of stream. The socket itself stays open,
/// and readable, until the stream is dropped.
#[async_trait]
impl Connection for TcpStream {
    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}
