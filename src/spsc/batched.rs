//! Single-producer single-consumer queue with batched counter publication.
//!
//! A variant of [`cached`](super::cached) that defers publishing the shared
//! counters: each endpoint advances a private position on every operation
//! but only release-stores it into the shared counter once
//! [`DEFAULT_MAX_BATCH`] unpublished operations have accumulated, or when
//! the endpoint itself is blocked on an apparently full/empty queue.
//!
//! # Stalls under low traffic
//!
//! **This variant is a baseline, kept for its failure mode.** If the
//! producer goes idle with fewer than `max_batch` unpublished items, the
//! consumer never observes them: `recv` blocks indefinitely even though
//! the queue holds data (and symmetrically, consumed slots can stay
//! invisible to the producer). The batching is only sound under sustained
//! traffic, where the full/empty stall paths force publication. Use
//! [`cached`](super::cached), which publishes on every operation, for
//! anything real.
//!
//! ```no_run
//! use std::time::Duration;
//! use lockring::spsc::batched;
//!
//! let (mut tx, mut rx) = batched::channel::<u64>(8);
//! tx.send(1).unwrap();
//!
//! // The item is in the ring, but its publication is still batched:
//! // this times out.
//! assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
//! ```

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::{CloseFlag, RecvError, RecvTimeoutError, SendError, TrySendError};

/// Unpublished operations an endpoint accumulates before it publishes its
/// shared counter.
pub const DEFAULT_MAX_BATCH: usize = (1 << 8) - 1;

/// Creates a new batched SPSC queue with the given capacity and the
/// default batch threshold of [`DEFAULT_MAX_BATCH`].
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    channel_with_batch(capacity, DEFAULT_MAX_BATCH)
}

/// Creates a new batched SPSC queue with a custom batch threshold.
///
/// A `max_batch` of 1 publishes on every operation, making this behave
/// like [`cached`](super::cached).
///
/// The actual capacity is rounded up to the next power of two.
pub fn channel_with_batch<T>(capacity: usize, max_batch: usize) -> (Sender<T>, Receiver<T>) {
    let capacity = capacity.next_power_of_two();
    let buffer = ManuallyDrop::new(Vec::<T>::with_capacity(capacity)).as_mut_ptr();

    let inner = Arc::new(Inner {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        closed: CloseFlag::new(),
        buffer,
        capacity,
        mask: capacity - 1,
        max_batch,
    });

    (
        Sender {
            local_head: 0,
            published_head: 0,
            inner: Arc::clone(&inner),
        },
        Receiver {
            local_tail: 0,
            published_tail: 0,
            inner,
        },
    )
}

/// Shared state between producer and consumer.
#[repr(C)]
struct Inner<T> {
    /// Producer's published write position. Trails the producer's private
    /// position by up to `max_batch`.
    head: CachePadded<AtomicUsize>,
    /// Consumer's published read position, trailing symmetrically.
    tail: CachePadded<AtomicUsize>,

    closed: CloseFlag,

    // === Immutable after construction ===
    buffer: *mut T,
    capacity: usize,
    mask: usize,
    max_batch: usize,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Endpoint Drop impls publish their private counters first, so the
        // shared counters are exact by the time the last Arc goes away.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);

        let mut i = tail;
        while i != head {
            unsafe {
                self.buffer.add(i & self.mask).drop_in_place();
            }
            i = i.wrapping_add(1);
        }

        unsafe {
            let _ = Vec::from_raw_parts(self.buffer, 0, self.capacity);
        }
    }
}

/// The sending half of the queue.
///
/// Takes `&mut self` to statically ensure single-producer access.
pub struct Sender<T> {
    /// Our true write position. Ahead of the published counter by the
    /// current unpublished batch.
    local_head: usize,
    /// Shadow of the last value we stored into the shared counter.
    published_head: usize,

    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Sends a value, blocking while the queue is full.
    ///
    /// The item lands in the ring immediately, but the consumer may not
    /// observe it until the batch threshold is reached (see the module
    /// docs for the stall this causes).
    ///
    /// Returns `Err(SendError(value))` if the queue is closed.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        let head = self.local_head;

        loop {
            if self.inner.closed.is_closed() {
                return Err(SendError(value));
            }
            let tail = self.inner.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) < self.inner.capacity {
                break;
            }
            // Blocked on full: flush the pending batch so the consumer
            // can make progress against it
            self.publish(head);
            thread::yield_now();
        }

        unsafe {
            self.inner.buffer.add(head & self.inner.mask).write(value);
        }
        self.local_head = head.wrapping_add(1);
        if self.local_head.wrapping_sub(self.published_head) >= self.inner.max_batch {
            self.publish(self.local_head);
        }
        Ok(())
    }

    /// Attempts to send a value without blocking.
    ///
    /// A `Full` outcome flushes the pending batch before returning, so a
    /// stalled consumer can drain.
    pub fn try_send(&mut self, value: T) -> Result<(), TrySendError<T>> {
        if self.inner.closed.is_closed() {
            return Err(TrySendError::Closed(value));
        }

        let head = self.local_head;
        let tail = self.inner.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.inner.capacity {
            self.publish(head);
            return Err(TrySendError::Full(value));
        }

        unsafe {
            self.inner.buffer.add(head & self.inner.mask).write(value);
        }
        self.local_head = head.wrapping_add(1);
        if self.local_head.wrapping_sub(self.published_head) >= self.inner.max_batch {
            self.publish(self.local_head);
        }
        Ok(())
    }

    #[inline]
    fn publish(&mut self, head: usize) {
        if self.published_head != head {
            self.inner.head.store(head, Ordering::Release);
            self.published_head = head;
        }
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Closes the queue. Idempotent; wakes the blocked peer within a
    /// scheduling quantum.
    pub fn close(&self) {
        self.inner.closed.close();
    }

    /// Returns `true` if the queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // Flush so teardown (and a still-running consumer) sees every item
        self.publish(self.local_head);
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The receiving half of the queue.
///
/// Takes `&mut self` to statically ensure single-consumer access.
pub struct Receiver<T> {
    /// Our true read position.
    local_tail: usize,
    /// Shadow of the last value we stored into the shared counter.
    published_tail: usize,

    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, blocking while the queue appears empty.
    ///
    /// "Appears" is load-bearing: items the producer has not yet published
    /// are invisible, so this can block forever on a non-empty ring (the
    /// module-level stall).
    ///
    /// Returns `Err(RecvError)` if the queue is closed.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        self.recv_deadline(Duration::ZERO).map_err(|_| RecvError)
    }

    /// Receives the next value, giving up after `timeout`.
    ///
    /// A zero timeout waits indefinitely.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_deadline(timeout)
    }

    fn recv_deadline(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let start = (timeout > Duration::ZERO).then(Instant::now);
        let tail = self.local_tail;

        loop {
            if self.inner.closed.is_closed() {
                return Err(RecvTimeoutError::Closed);
            }
            let head = self.inner.head.load(Ordering::Acquire);
            if tail != head {
                break;
            }
            // Blocked on empty: flush our pending batch so the producer
            // can make progress against it
            self.publish(tail);
            if let Some(start) = start {
                if start.elapsed() >= timeout {
                    return Err(RecvTimeoutError::Timeout);
                }
            }
            thread::yield_now();
        }

        let value = unsafe { self.inner.buffer.add(tail & self.inner.mask).read() };
        self.local_tail = tail.wrapping_add(1);
        if self.local_tail.wrapping_sub(self.published_tail) >= self.inner.max_batch {
            self.publish(self.local_tail);
        }
        Ok(value)
    }

    /// Attempts to receive a value without blocking.
    ///
    /// An empty outcome flushes the pending read batch before returning.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.inner.closed.is_closed() {
            return None;
        }

        let tail = self.local_tail;
        let head = self.inner.head.load(Ordering::Acquire);
        if tail == head {
            self.publish(tail);
            return None;
        }

        let value = unsafe { self.inner.buffer.add(tail & self.inner.mask).read() };
        self.local_tail = tail.wrapping_add(1);
        if self.local_tail.wrapping_sub(self.published_tail) >= self.inner.max_batch {
            self.publish(self.local_tail);
        }
        Some(value)
    }

    #[inline]
    fn publish(&mut self, tail: usize) {
        if self.published_tail != tail {
            self.inner.tail.store(tail, Ordering::Release);
            self.published_tail = tail;
        }
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Closes the queue. Idempotent; wakes the blocked peer within a
    /// scheduling quantum.
    pub fn close(&self) {
        self.inner.closed.close();
    }

    /// Returns `true` if the queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.publish(self.local_tail);
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
