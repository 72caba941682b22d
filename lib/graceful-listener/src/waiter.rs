use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::gate::Gate;

/// How a call to [CountdownWaiter::wait] was released.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The live count reached zero.
    Drained,
    /// [CountdownWaiter::cancel_wait] was called, or the cycle was reset under the waiter.
    Cancelled,
}

/// A cancellable and restartable "wait until the count reaches zero" primitive.
///
/// The count itself lives across cycles. Everything a waiter can observe (the done and cancel
/// gates, the number of registered waiters) belongs to a cycle, and [CountdownWaiter::reset]
/// starts a new one. Gates are single use so a cycle has to be reset before it is waited on
/// again after being released.
pub struct CountdownWaiter {
    count: AtomicU64,
    cycle: Mutex<Cycle>,
}

struct Cycle {
    generation: u64,
    /// Callers that entered `wait` during this cycle.
    waiting: usize,
    done: Gate,
    cancel: Gate,
}

impl Cycle {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            waiting: 0,
            done: Gate::new(),
            cancel: Gate::new(),
        }
    }
}

impl Default for CountdownWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl CountdownWaiter {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            cycle: Mutex::new(Cycle::new(0)),
        }
    }

    /// Number of units added and not yet marked done.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// The current cycle, bumped by every [CountdownWaiter::reset].
    pub fn generation(&self) -> u64 {
        self.cycle.lock().generation
    }

    #[inline]
    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark one unit as done. Reaching zero while somebody is waiting releases the waiters.
    ///
    /// Every call must be paired with an earlier [CountdownWaiter::add]; an unpaired call is a
    /// bug in the caller and leaves the count at zero.
    pub fn done(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));

        match prev {
            Ok(1) => {
                // The waiter registration reads the count under this same lock, so either it
                // sees zero or we see it registered. An `add` may have landed since the
                // decrement, so the count is read again here.
                let cycle = self.cycle.lock();
                if cycle.waiting > 0 && self.count() == 0 && cycle.done.release() {
                    trace!(generation = cycle.generation, "countdown drained");
                }
            },
            Ok(_) => {},
            Err(_) => {
                error!("countdown waiter marked done more times than added");
                if cfg!(debug_assertions) {
                    panic!("unbalanced CountdownWaiter::done");
                }
            },
        }
    }

    /// Wait until the count reaches zero or the wait is cancelled.
    ///
    /// If the count is already zero when this is called it returns right away, which covers the
    /// last `done` running before anyone was waiting.
    pub async fn wait(&self) -> WaitOutcome {
        let (done, cancel) = {
            let mut cycle = self.cycle.lock();
            cycle.waiting += 1;
            if self.count() == 0 {
                cycle.done.release();
            }
            (cycle.done.clone(), cycle.cancel.clone())
        };

        tokio::select! {
            biased;
            _ = done.wait() => WaitOutcome::Drained,
            _ = cancel.wait() => WaitOutcome::Cancelled,
        }
    }

    /// Release every waiter of the current cycle without touching the count.
    pub fn cancel_wait(&self) {
        let cycle = self.cycle.lock();
        if cycle.cancel.release() {
            trace!(generation = cycle.generation, "countdown wait cancelled");
        }
    }

    /// Start a new cycle with fresh gates. Waiters still parked on the previous cycle are
    /// released as cancelled.
    pub fn reset(&self) {
        let mut cycle = self.cycle.lock();
        cycle.cancel.release();
        *cycle = Cycle::new(cycle.generation + 1);
    }
}
