use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Acceptance is already suspended by someone else, or the listener has been closed.
    #[error("already stopped")]
    AlreadyStopped,
    /// The drain deadline passed while connections were still live. The listener is left open.
    #[error("timeout: {remaining} connection(s) remain alive")]
    Timeout { remaining: u64 },
    /// The error originated from the underlying listener.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShutdownError {
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
