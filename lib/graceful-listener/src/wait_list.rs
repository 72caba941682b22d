use std::num::NonZeroUsize;
use std::task::{Context, Poll, Waker};

pub const WAIT_LIST_DEFAULT_CAPACITY: usize = 8;

/// The wait list holds the wakers of every future parked on a [Gate](crate::Gate) and can wake
/// all of them at once.
///
/// A wait list is single use: once released it never goes back to pending and every later poll
/// resolves immediately. Reusing a gate for a new cycle means allocating a new wait list.
///
/// Storage is an arena with an embedded free list. Anytime a slot is freed we replace it with a
/// link to the previously freed slot, or with [ArenaEntry::Empty] if the free list was empty.
pub struct WaitList {
    /// The current state of the wait list which begins at [State::Pending].
    state: State,

    /// Number of live wakers in the arena.
    len: usize,

    /// Position of the last freed slot in the arena.
    last_freed: Option<usize>,

    /// The free-list embedded vector of wakers.
    arena: Vec<ArenaEntry>,
}

enum ArenaEntry {
    Empty,
    Link(usize),
    Item(Waker),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Released,
}

/// An owning opaque pointer to a slot in a wait list. It is a plain index that is neither Copy
/// nor Clone so a slot can only be deregistered once.
#[repr(transparent)]
pub struct WaitListSlotPos {
    value: NonZeroUsize,
}

impl WaitListSlotPos {
    #[inline(always)]
    fn new(index: usize) -> Self {
        Self {
            // SAFETY: index >= 0 -> index + 1 >= 1 -> (index + 1) != 0
            value: unsafe { NonZeroUsize::new_unchecked(index + 1) },
        }
    }

    #[inline(always)]
    fn get(&self) -> usize {
        usize::from(self.value) - 1
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new(WAIT_LIST_DEFAULT_CAPACITY)
    }
}

impl WaitList {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: State::Pending,
            len: 0,
            last_freed: None,
            arena: Vec::with_capacity(capacity),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_released(&self) -> bool {
        matches!(self.state, State::Released)
    }

    /// Register a new waker. Fails once the list has been released.
    #[inline]
    fn register(&mut self, waker: Waker) -> Result<WaitListSlotPos, ()> {
        if self.is_released() {
            return Err(());
        }

        let vec_len = self.arena.len();
        self.len += 1;

        // Only consult the free list when pushing would reallocate.
        if self.arena.capacity() == vec_len {
            if let Some(index) = self.last_freed {
                self.last_freed = match self.arena[index] {
                    ArenaEntry::Empty => None,
                    ArenaEntry::Link(index) => Some(index),
                    ArenaEntry::Item(_) => unreachable!(),
                };

                self.arena[index] = ArenaEntry::Item(waker);
                return Ok(WaitListSlotPos::new(index));
            }
        }

        self.arena.push(ArenaEntry::Item(waker));
        Ok(WaitListSlotPos::new(vec_len))
    }

    /// Remove a previously registered waker from the list.
    #[inline]
    pub fn deregister(&mut self, ptr: WaitListSlotPos) {
        self.len -= 1;
        self.arena[ptr.get()] = match self.last_freed {
            Some(index) => ArenaEntry::Link(index),
            None => ArenaEntry::Empty,
        };
        self.last_freed = Some(ptr.get());
    }

    /// Release the list and wake up every registered waker. Returns `false` if the list was
    /// already released, in which case nothing is woken.
    pub fn wake_all(&mut self) -> bool {
        if self.is_released() {
            return false;
        }
        self.state = State::Released;
        for item in &self.arena {
            if let ArenaEntry::Item(waker) = item {
                waker.wake_by_ref();
            }
        }
        true
    }

    /// The poll shared by every future parked on a wait list. The future keeps its slot in
    /// `prev_index` and must hand it back to [WaitList::deregister] when dropped.
    #[inline(always)]
    pub fn poll(&mut self, prev_index: &mut Option<WaitListSlotPos>, cx: &mut Context) -> Poll<()> {
        if self.is_released() {
            return Poll::Ready(());
        }

        if let Some(idx) = &*prev_index {
            match &mut self.arena[idx.get()] {
                ArenaEntry::Item(waker) => waker.clone_from(cx.waker()),
                _ => panic!("wrong index!"),
            }
        } else {
            match self.register(cx.waker().clone()) {
                Ok(idx) => *prev_index = Some(idx),
                Err(()) => return Poll::Ready(()),
            }
        }

        Poll::Pending
    }
}
