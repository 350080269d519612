//! Bounded blocking FIFO between the change detector and the dispatcher.
//!
//! A fixed ring of `capacity` slots guarded by one mutex, with two condition
//! variables playing the "slots free" and "items ready" signals. Producers
//! block while the ring is full and consumers block while it is empty;
//! nothing is ever dropped, so a slow consumer stalls producers instead of
//! losing events.
//!
//! The `*_timeout` variants return within the given bound so long-running
//! callers can re-check a cancellation flag between waits. The lock is only
//! ever held for the slot update itself, never across a caller's code.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Fixed-capacity FIFO with blocking insert and remove.
pub struct EventQueue<T> {
    ring: Mutex<Ring<T>>,
    slots_free: Condvar,
    items_ready: Condvar,
}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        item
    }
}

impl<T> EventQueue<T> {
    /// Create an empty queue holding at most `capacity` items.
    ///
    /// # Panics
    /// Panics if `capacity` is zero; configuration validation rejects that
    /// before a queue is ever built.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event queue capacity must be non-zero");
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            slots_free: Condvar::new(),
            items_ready: Condvar::new(),
        }
    }

    /// Append `item`, blocking for as long as the queue is full.
    pub fn enqueue(&self, item: T) {
        let mut ring = self.ring.lock();
        while ring.is_full() {
            self.slots_free.wait(&mut ring);
        }
        ring.push(item);
        drop(ring);
        self.items_ready.notify_one();
    }

    /// Append `item`, waiting at most `timeout` for a free slot.
    ///
    /// Hands the item back when the queue stayed full for the whole wait.
    pub fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        while ring.is_full() {
            if self.slots_free.wait_until(&mut ring, deadline).timed_out() && ring.is_full() {
                return Err(item);
            }
        }
        ring.push(item);
        drop(ring);
        self.items_ready.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking for as long as the queue is empty.
    pub fn dequeue(&self) -> T {
        let mut ring = self.ring.lock();
        loop {
            if let Some(item) = ring.pop() {
                drop(ring);
                self.slots_free.notify_one();
                return item;
            }
            self.items_ready.wait(&mut ring);
        }
    }

    /// Remove the oldest item, waiting at most `timeout` for one to arrive.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if let Some(item) = ring.pop() {
                drop(ring);
                self.slots_free.notify_one();
                return Some(item);
            }
            if self.items_ready.wait_until(&mut ring, deadline).timed_out() {
                let item = ring.pop()?;
                drop(ring);
                self.slots_free.notify_one();
                return Some(item);
            }
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl<T> fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("EventQueue")
            .field("len", &ring.count)
            .field("capacity", &ring.capacity())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
