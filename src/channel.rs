//! Bounded single-producer/single-consumer hand-off with an object pool.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Default queue capacity. Small, but enough to ride out scheduling jitter
/// between the capture and decode threads.
pub const DEFAULT_CAPACITY: usize = 64;

/// Bounded SPSC FIFO over pool-recycled elements.
///
/// The producer side is `retain` → fill → `push` → (eventually) `close`;
/// the consumer side is `pull` → process → `release`. Ownership of each
/// element moves with the `Box`, so an element is always in exactly one of:
/// the free list, the producer's hands, the queue, or the consumer's hands.
///
/// `push` blocks while the queue is full and `pull` blocks while it is
/// empty; `pull` returning `None` (closed and drained) is the consumer's
/// termination signal. Share across threads with `Arc`.
pub struct Channel<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

struct State<T> {
    queue: VecDeque<Box<T>>,
    pool: Vec<Box<T>>,
    closed: bool,
    push_waits: u64,
    pull_waits: u64,
}

impl<T: Default> Channel<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a channel holding at most `capacity` queued elements.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 1, "channel capacity must be greater than one");
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                pool: Vec::new(),
                closed: false,
                push_waits: 0,
                pull_waits: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Producer: obtain a writable element, reusing the free list when
    /// possible. Never blocks.
    pub fn retain(&self) -> Box<T> {
        let mut st = self.state.lock().unwrap();
        st.pool.pop().unwrap_or_default()
    }

    /// Producer: enqueue an element, blocking while the queue is full.
    ///
    /// # Panics
    ///
    /// Panics if the channel has been closed — pushing after `close` is a
    /// producer-side programming error.
    pub fn push(&self, item: Box<T>) {
        let mut st = self.state.lock().unwrap();
        while st.queue.len() >= self.capacity && !st.closed {
            st.push_waits += 1;
            st = self.not_full.wait(st).unwrap();
        }
        assert!(!st.closed, "push on closed channel");
        st.queue.push_back(item);
        drop(st);
        self.not_empty.notify_one();
    }

    /// Consumer: dequeue the next element, blocking while the queue is
    /// empty and the channel is open. Returns `None` once the channel is
    /// closed and drained.
    pub fn pull(&self) -> Option<Box<T>> {
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(item) = st.queue.pop_front() {
                drop(st);
                self.not_full.notify_one();
                return Some(item);
            }
            if st.closed {
                return None;
            }
            st.pull_waits += 1;
            st = self.not_empty.wait(st).unwrap();
        }
    }

    /// Consumer: return a processed element to the free list.
    pub fn release(&self, item: Box<T>) {
        let mut st = self.state.lock().unwrap();
        // The pool never needs more elements than can be in flight.
        if st.pool.len() <= self.capacity + 1 {
            st.pool.push(item);
        }
    }

    /// Producer: signal end-of-stream. Idempotent; wakes all waiters.
    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        drop(st);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many times `push` had to wait for space.
    pub fn push_waits(&self) -> u64 {
        self.state.lock().unwrap().push_waits
    }

    /// How many times `pull` had to wait for data.
    pub fn pull_waits(&self) -> u64 {
        self.state.lock().unwrap().pull_waits
    }
}

impl<T: Default> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}
