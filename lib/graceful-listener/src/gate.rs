use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Future;
use parking_lot::Mutex;
use triomphe::Arc;

use crate::wait_list::{WaitList, WaitListSlotPos};

/// A one-shot broadcast signal.
///
/// Any number of tasks can wait on a gate. Releasing it wakes all of them together, and every
/// wait started after the release resolves immediately. A released gate stays released; the
/// next cycle needs a new gate. Clones share the same signal.
#[derive(Clone)]
pub struct Gate {
    list: Arc<Mutex<WaitList>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            list: Arc::new(Mutex::new(WaitList::default())),
        }
    }

    /// Release the gate and wake every waiter. Returns `true` only for the call that actually
    /// released it.
    pub fn release(&self) -> bool {
        self.list.lock().wake_all()
    }

    pub fn is_released(&self) -> bool {
        self.list.lock().is_released()
    }

    /// Number of futures currently parked on the gate.
    pub fn waiters(&self) -> usize {
        self.list.lock().len()
    }

    /// Returns a future that is resolved once the gate is released.
    pub fn wait(&self) -> GateFuture {
        GateFuture {
            gate: self.clone(),
            list_position: None,
        }
    }
}

/// A future that is resolved once its [Gate] is released. It owns a handle to the gate so it can
/// outlive the lock it was obtained under.
pub struct GateFuture {
    gate: Gate,

    /// Our position in the wait list.
    list_position: Option<WaitListSlotPos>,
}

impl Future for GateFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut wait_list = this.gate.list.lock();
        wait_list.poll(&mut this.list_position, cx)
    }
}

impl Drop for GateFuture {
    fn drop(&mut self) {
        if let Some(slot) = self.list_position.take() {
            self.gate.list.lock().deregister(slot);
        }
    }
}
