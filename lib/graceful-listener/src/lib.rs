//! Graceful shutdown for listening sockets.
//!
//! A [GracefulListener] decorates a transport [Listener]. It can suspend accepting new
//! connections without closing the listener, and it keeps count of the connections it handed out
//! so a shutdown can wait for them to finish before the listener is closed.

mod config;
mod connection;
mod error;
mod gate;
mod listener;
pub mod signal;
pub mod transports;
mod wait_list;
mod waiter;

pub use config::ShutdownConfig;
pub use connection::GracefulConnection;
pub use error::ShutdownError;
pub use gate::{Gate, GateFuture};
pub use listener::{upgrade, GracefulListener, ResumeHandle};
pub use transports::tcp::TcpTransport;
#[cfg(unix)]
pub use transports::unix::UnixTransport;
pub use transports::{Connection, Listener};
pub use waiter::{CountdownWaiter, WaitOutcome};
