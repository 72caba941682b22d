use std::io;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use triomphe::Arc;

use crate::config::ShutdownConfig;
use crate::connection::GracefulConnection;
use crate::error::ShutdownError;
use crate::gate::Gate;
use crate::transports::Listener;
use crate::waiter::CountdownWaiter;

/// Wrap `listener` so it can be shut down gracefully.
pub fn upgrade<L: Listener>(listener: L) -> GracefulListener<L> {
    GracefulListener::new(listener)
}

/// A listener decorator that can stop accepting, wait for the connections it handed out to
/// finish, and only then close the underlying listener.
///
/// All methods take `&self`; share it behind an `Arc` between the accept loop and whoever drives
/// the shutdown.
pub struct GracefulListener<L: Listener> {
    listener: L,
    waiter: Arc<CountdownWaiter>,
    suspension: Arc<Suspension>,
}

/// The accept state machine. Shared with [ResumeHandle]s so they can outlive a borrow of the
/// listener.
struct Suspension {
    state: Mutex<SuspensionState>,
}

struct SuspensionState {
    accept: AcceptState,
    /// Generation handed to the last suspension.
    generation: u64,
}

enum AcceptState {
    /// `paused` is released when a suspension starts, interrupting accepts already in flight.
    Accepting { paused: Gate },
    /// Accept callers park on `resumed` until the suspension identified by `generation` ends.
    Suspended { generation: u64, resumed: Gate },
    Closed,
}

/// What an accept call is allowed to do right now.
enum Admission {
    Open(Gate),
    Parked(Gate),
    Closed,
}

impl Suspension {
    fn new() -> Self {
        Self {
            state: Mutex::new(SuspensionState {
                accept: AcceptState::Accepting { paused: Gate::new() },
                generation: 0,
            }),
        }
    }

    fn admission(&self) -> Admission {
        match &self.state.lock().accept {
            AcceptState::Accepting { paused } => Admission::Open(paused.clone()),
            AcceptState::Suspended { resumed, .. } => Admission::Parked(resumed.clone()),
            AcceptState::Closed => Admission::Closed,
        }
    }

    /// Move from accepting to suspended. Returns the generation of the new suspension, or `None`
    /// if we are not accepting.
    fn suspend(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let AcceptState::Accepting { paused } = &state.accept else {
            return None;
        };
        let paused = paused.clone();
        paused.release();
        state.generation += 1;
        let generation = state.generation;
        state.accept = AcceptState::Suspended {
            generation,
            resumed: Gate::new(),
        };
        Some(generation)
    }

    /// End the suspension `generation` if it is still the active one.
    fn resume(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        let resumed = match &state.accept {
            AcceptState::Suspended {
                generation: active,
                resumed,
            } if *active == generation => resumed.clone(),
            _ => return false,
        };
        resumed.release();
        state.accept = AcceptState::Accepting { paused: Gate::new() };
        true
    }

    /// Enter the terminal state and wake every parked or in-flight accept so it can observe the
    /// closed listener.
    fn close(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut state.accept, AcceptState::Closed) {
            AcceptState::Accepting { paused } => {
                paused.release();
            },
            AcceptState::Suspended { resumed, .. } => {
                resumed.release();
            },
            AcceptState::Closed => {},
        }
    }

    fn is_suspended(&self) -> bool {
        matches!(self.state.lock().accept, AcceptState::Suspended { .. })
    }

    fn is_closed(&self) -> bool {
        matches!(self.state.lock().accept, AcceptState::Closed)
    }
}

/// Ends the suspension started by [GracefulListener::stop_accept].
///
/// Resuming wakes every accept parked during the suspension. Dropping the handle resumes as well,
/// so keep it alive for as long as acceptance should stay paused. A handle only ever ends its own
/// suspension; once the listener is closed it does nothing.
#[must_use = "dropping the handle resumes accepting right away"]
pub struct ResumeHandle {
    suspension: Option<Arc<Suspension>>,
    generation: u64,
}

impl ResumeHandle {
    pub fn resume(mut self) {
        self.resume_inner();
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn resume_inner(&mut self) {
        if let Some(suspension) = self.suspension.take() {
            if suspension.resume(self.generation) {
                debug!(generation = self.generation, "resumed accepting connections");
            }
        }
    }
}

impl Drop for ResumeHandle {
    fn drop(&mut self) {
        self.resume_inner();
    }
}

impl<L: Listener> GracefulListener<L> {
    pub fn new(listener: L) -> Self {
        let waiter = CountdownWaiter::new();
        waiter.reset();
        Self {
            listener,
            waiter: Arc::new(waiter),
            suspension: Arc::new(Suspension::new()),
        }
    }

    /// Accept the next connection.
    ///
    /// While acceptance is suspended this waits for the suspension to end. An accept that is
    /// already waiting on the underlying listener when a suspension starts is withdrawn and
    /// waits as well. After the listener is closed this returns the underlying listener's error.
    pub async fn accept(&self) -> io::Result<(GracefulConnection<L::Connection>, L::Addr)> {
        loop {
            match self.suspension.admission() {
                Admission::Open(paused) => {
                    tokio::select! {
                        biased;
                        _ = paused.wait() => {
                            trace!("accept withdrawn by suspension");
                        },
                        res = self.listener.accept() => return self.register(res),
                    }
                },
                Admission::Parked(resumed) => {
                    trace!("accept parked while suspended");
                    resumed.wait().await;
                },
                Admission::Closed => return self.register(self.listener.accept().await),
            }
        }
    }

    fn register(
        &self,
        res: io::Result<(L::Connection, L::Addr)>,
    ) -> io::Result<(GracefulConnection<L::Connection>, L::Addr)> {
        let (conn, addr) = res?;
        self.waiter.add();
        trace!(?addr, live = self.waiter.count(), "accepted connection");
        Ok((GracefulConnection::new(conn, self.waiter.clone()), addr))
    }

    /// Close the underlying listener right away, without waiting for live connections.
    pub fn close(&self) -> io::Result<()> {
        let result = self.listener.close();
        self.suspension.close();
        result
    }

    /// Same as [GracefulListener::close].
    #[inline]
    pub fn shutdown(&self) -> io::Result<()> {
        self.close()
    }

    /// Suspend accepting new connections without closing the listener.
    ///
    /// Fails with [ShutdownError::AlreadyStopped] while another suspension is active or after
    /// the listener was closed.
    pub fn stop_accept(&self) -> Result<ResumeHandle, ShutdownError> {
        let generation = self
            .suspension
            .suspend()
            .ok_or(ShutdownError::AlreadyStopped)?;
        debug!(generation, "suspended accepting connections");
        Ok(ResumeHandle {
            suspension: Some(self.suspension.clone()),
            generation,
        })
    }

    /// Stop accepting, wait for every live connection to finish and close the listener.
    ///
    /// With a non-zero `timeout` the wait is bounded: once it passes this returns
    /// [ShutdownError::Timeout] and leaves the listener open and accepting again, so the
    /// shutdown can be retried or forced with [GracefulListener::close]. Acceptance is resumed
    /// on every return path.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
        let _resume = self.stop_accept()?;
        self.waiter.reset();
        info!(
            live = self.waiter.count(),
            ?timeout,
            "graceful shutdown started"
        );

        match timeout.filter(|timeout| !timeout.is_zero()) {
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.waiter.wait())
                    .await
                    .is_err()
                {
                    self.waiter.cancel_wait();
                    let remaining = self.waiter.count();
                    warn!(remaining, "graceful shutdown timed out");
                    return Err(ShutdownError::Timeout { remaining });
                }
            },
            None => {
                self.waiter.wait().await;
            },
        }

        self.close()?;
        info!("graceful shutdown complete");
        Ok(())
    }

    /// [GracefulListener::graceful_shutdown] with the timeout from `config`.
    pub async fn graceful_shutdown_with(
        &self,
        config: &ShutdownConfig,
    ) -> Result<(), ShutdownError> {
        self.graceful_shutdown(config.timeout).await
    }

    /// Number of accepted connections that have not finished yet.
    pub fn live_connections(&self) -> u64 {
        self.waiter.count()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension.is_suspended()
    }

    pub fn is_closed(&self) -> bool {
        self.suspension.is_closed()
    }

    pub fn local_addr(&self) -> io::Result<L::Addr> {
        self.listener.local_addr()
    }

    pub fn get_ref(&self) -> &L {
        &self.listener
    }
}

#[async_trait]
impl<L: Listener> Listener for GracefulListener<L> {
    type Connection = GracefulConnection<L::Connection>;
    type Addr = L::Addr;

    async fn accept(&self) -> io::Result<(Self::Connection, L::Addr)> {
        GracefulListener::accept(self).await
    }

    fn close(&self) -> io::Result<()> {
        GracefulListener::close(self)
    }

    fn local_addr(&self) -> io::Result<L::Addr> {
        GracefulListener::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transports::{listener_closed, Connection};

    /// An in-memory listener fed through a channel.
    struct MockListener {
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockConnection>>,
        closed: Gate,
        next_addr: AtomicUsize,
    }

    /// Fails its first `interrupts` closes with [io::ErrorKind::Interrupted].
    #[derive(Debug)]
    struct MockConnection {
        interrupts: usize,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn close(&mut self) -> io::Result<()> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Err(io::ErrorKind::Interrupted.into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Listener for MockListener {
        type Connection = MockConnection;
        type Addr = usize;

        async fn accept(&self) -> io::Result<(MockConnection, usize)> {
            if self.closed.is_released() {
                return Err(listener_closed());
            }
            let mut rx = self.rx.lock().await;
            tokio::select! {
                conn = rx.recv() => {
                    let conn = conn.ok_or_else(listener_closed)?;
                    Ok((conn, self.next_addr.fetch_add(1, Ordering::Relaxed)))
                },
                _ = self.closed.wait() => Err(listener_closed()),
            }
        }

        fn close(&self) -> io::Result<()> {
            if !self.closed.release() {
                return Err(listener_closed());
            }
            Ok(())
        }

        fn local_addr(&self) -> io::Result<usize> {
            Ok(0)
        }
    }

    fn mock() -> (
        std::sync::Arc<GracefulListener<MockListener>>,
        mpsc::UnboundedSender<MockConnection>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = upgrade(MockListener {
            rx: tokio::sync::Mutex::new(rx),
            closed: Gate::new(),
            next_addr: AtomicUsize::new(1),
        });
        (std::sync::Arc::new(listener), tx)
    }

    fn dial(tx: &mpsc::UnboundedSender<MockConnection>) {
        tx.send(MockConnection { interrupts: 0 }).unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn accept_registers_connections() {
        let (ln, tx) = mock();
        dial(&tx);
        dial(&tx);

        let (mut first, addr) = ln.accept().await.unwrap();
        assert_eq!(addr, 1);
        let (second, _) = ln.accept().await.unwrap();
        assert_eq!(ln.live_connections(), 2);

        first.close().await.unwrap();
        assert_eq!(ln.live_connections(), 1);
        drop(second);
        assert_eq!(ln.live_connections(), 0);
    }

    #[tokio::test]
    async fn failed_accept_is_not_registered() {
        let (ln, tx) = mock();
        drop(tx);
        let err = ln.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(ln.live_connections(), 0);
    }

    #[tokio::test]
    async fn second_stop_accept_fails_and_keeps_first() {
        let (ln, _tx) = mock();
        let resume = ln.stop_accept().unwrap();
        assert!(matches!(
            ln.stop_accept(),
            Err(ShutdownError::AlreadyStopped)
        ));
        assert!(ln.is_suspended());

        resume.resume();
        assert!(!ln.is_suspended());

        let again = ln.stop_accept().unwrap();
        assert_eq!(again.generation(), 2);
    }

    #[tokio::test]
    async fn accept_parks_until_resume() {
        let (ln, tx) = mock();
        let resume = ln.stop_accept().unwrap();
        dial(&tx);

        let pending = tokio::spawn({
            let ln = ln.clone();
            async move { ln.accept().await.map(|(_, addr)| addr) }
        });
        settle().await;
        assert!(!pending.is_finished());

        resume.resume();
        assert_eq!(pending.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn suspension_withdraws_in_flight_accept() {
        let (ln, tx) = mock();
        let pending = tokio::spawn({
            let ln = ln.clone();
            async move { ln.accept().await }
        });
        settle().await;

        let resume = ln.stop_accept().unwrap();
        settle().await;
        dial(&tx);
        settle().await;
        assert!(!pending.is_finished());
        assert_eq!(ln.live_connections(), 0);

        drop(resume);
        let (conn, addr) = pending.await.unwrap().unwrap();
        assert_eq!(addr, 1);
        assert_eq!(ln.live_connections(), 1);

        drop(conn);
        assert_eq!(ln.live_connections(), 0);
    }

    #[tokio::test]
    async fn close_while_suspended_fails_parked_accept() {
        let (ln, _tx) = mock();
        let resume = ln.stop_accept().unwrap();
        let pending = tokio::spawn({
            let ln = ln.clone();
            async move { ln.accept().await.map(|(_, addr)| addr) }
        });
        settle().await;

        ln.close().unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        // A handle outliving the close does not reopen acceptance.
        resume.resume();
        assert!(ln.is_closed());
        assert!(matches!(
            ln.stop_accept(),
            Err(ShutdownError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_connections() {
        let (ln, tx) = mock();
        dial(&tx);
        dial(&tx);
        let (mut a, _) = ln.accept().await.unwrap();
        let (mut b, _) = ln.accept().await.unwrap();

        let shutdown = tokio::spawn({
            let ln = ln.clone();
            async move { ln.graceful_shutdown(None).await }
        });
        settle().await;
        assert!(ln.is_suspended());

        a.close().await.unwrap();
        settle().await;
        assert!(!shutdown.is_finished());

        b.close().await.unwrap();
        shutdown.await.unwrap().unwrap();
        assert!(ln.is_closed());
    }

    #[tokio::test]
    async fn graceful_shutdown_without_connections_closes_immediately() {
        let (ln, _tx) = mock();
        ln.graceful_shutdown(Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(ln.is_closed());
        assert!(ln.close().is_err());
    }

    #[tokio::test]
    async fn timeout_leaves_listener_usable() {
        let (ln, tx) = mock();
        dial(&tx);
        let (mut conn, _) = ln.accept().await.unwrap();

        let err = ln
            .graceful_shutdown(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ShutdownError::Timeout { remaining: 1 }));
        assert!(!ln.is_suspended());
        assert!(!ln.is_closed());

        // Still accepting after the timeout.
        dial(&tx);
        let (late, _) = ln.accept().await.unwrap();
        assert_eq!(ln.live_connections(), 2);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            conn.close().await.unwrap();
            drop(late);
        });
        ln.graceful_shutdown(None).await.unwrap();
        assert!(ln.is_closed());
    }

    #[tokio::test]
    async fn graceful_shutdown_while_suspended_is_rejected() {
        let (ln, _tx) = mock();
        let _resume = ln.stop_accept().unwrap();
        let err = ln.graceful_shutdown(None).await.unwrap_err();
        assert!(matches!(err, ShutdownError::AlreadyStopped));
        assert!(!ln.is_closed());
    }

    #[tokio::test]
    async fn interrupted_close_holds_the_drain_until_timeout() {
        let (ln, tx) = mock();
        tx.send(MockConnection { interrupts: 3 }).unwrap();
        let (mut conn, _) = ln.accept().await.unwrap();
        for _ in 0..3 {
            assert_eq!(
                conn.close().await.unwrap_err().kind(),
                io::ErrorKind::Interrupted
            );
        }

        let err = ln
            .graceful_shutdown(Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        conn.close().await.unwrap();
        ln.graceful_shutdown(Some(Duration::from_millis(30)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_config_timeout_is_used() {
        let (ln, tx) = mock();
        dial(&tx);
        let (_conn, _) = ln.accept().await.unwrap();
        let config = ShutdownConfig {
            timeout: Some(Duration::from_millis(20)),
        };
        let err = ln.graceful_shutdown_with(&config).await.unwrap_err();
        assert!(err.is_timeout());
    }

    async fn accept_and_close<L: Listener>(ln: &L) -> io::Result<L::Addr> {
        let (mut conn, addr) = ln.accept().await?;
        conn.close().await?;
        Ok(addr)
    }

    #[tokio::test]
    async fn stacked_listener_is_driven_through_the_listener_trait() {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = upgrade(MockListener {
            rx: tokio::sync::Mutex::new(rx),
            closed: Gate::new(),
            next_addr: AtomicUsize::new(1),
        });
        let ln = upgrade(inner);

        dial(&tx);
        assert_eq!(accept_and_close(&ln).await.unwrap(), 1);
        assert_eq!(ln.live_connections(), 0);
        assert_eq!(ln.get_ref().live_connections(), 0);

        dial(&tx);
        let (conn, _) = Listener::accept(&ln).await.unwrap();
        assert_eq!(ln.live_connections(), 1);
        assert_eq!(ln.get_ref().live_connections(), 1);
        drop(conn);
        assert_eq!(ln.get_ref().live_connections(), 0);

        Listener::close(&ln).unwrap();
        assert!(ln.is_closed());
        assert!(ln.get_ref().is_closed());
        let err = accept_and_close(&ln).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(Listener::local_addr(&ln).unwrap(), 0);
    }
}
