//! Single-producer single-consumer queue using per-slot ready flags.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ buffer[0]: { ready: AtomicBool, data: T }                │
//! │ buffer[1]: { ready: AtomicBool, data: T }                │
//! │ ...                                                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! There are no shared counters at all: both indices are private to their
//! endpoint, and the hand-off rides entirely on each slot's `ready` flag.
//! A slot with `ready == false` belongs to the producer; `ready == true`
//! belongs to the consumer. Coordination traffic is spread across the slot
//! array instead of bouncing two counter cache lines between cores, which
//! makes this the fastest family member on most hardware.
//!
//! # Example
//!
//! ```
//! use lockring::spsc::slot;
//!
//! let (mut tx, mut rx) = slot::channel::<u64>(1024);
//!
//! tx.send(42).unwrap();
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::{CloseFlag, RecvError, RecvTimeoutError, SendError, TrySendError};

/// Creates a new SPSC queue with the given capacity.
///
/// The actual capacity is rounded up to the next power of two.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let capacity = capacity.next_power_of_two();

    let mut slots = ManuallyDrop::new(Vec::<Slot<T>>::with_capacity(capacity));
    for _ in 0..capacity {
        slots.push(Slot {
            ready: AtomicBool::new(false),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        });
    }
    let buffer = slots.as_mut_ptr();

    let inner = Arc::new(Inner {
        closed: CloseFlag::new(),
        buffer,
        capacity,
        mask: capacity - 1,
    });

    (
        Sender {
            local_head: 0,
            inner: Arc::clone(&inner),
        },
        Receiver {
            local_tail: 0,
            inner,
        },
    )
}

/// A slot with its own hand-off flag.
///
/// `ready == false`: writable by the producer.
/// `ready == true`: readable by the consumer.
#[repr(C)]
struct Slot<T> {
    ready: AtomicBool,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Shared state between producer and consumer.
struct Inner<T> {
    closed: CloseFlag,
    buffer: *mut Slot<T>,
    capacity: usize,
    mask: usize,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Drop any data still parked in ready slots
        for i in 0..self.capacity {
            let slot = unsafe { &*self.buffer.add(i) };
            if slot.ready.load(Ordering::Relaxed) {
                unsafe { (*slot.data.get()).assume_init_drop() };
            }
        }

        unsafe {
            let _ = Vec::from_raw_parts(self.buffer, self.capacity, self.capacity);
        }
    }
}

/// The sending half of the queue.
///
/// Takes `&mut self` to statically ensure single-producer access.
pub struct Sender<T> {
    /// Our write position. Never shared; the slot flags carry the protocol.
    local_head: usize,
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Sends a value, blocking while the target slot is still occupied.
    ///
    /// Returns `Err(SendError(value))` if the queue is closed.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        let inner = &*self.inner;
        let slot = unsafe { &*inner.buffer.add(self.local_head & inner.mask) };

        loop {
            if inner.closed.is_closed() {
                return Err(SendError(value));
            }
            if !slot.ready.load(Ordering::Acquire) {
                break;
            }
            thread::yield_now();
        }

        unsafe { (*slot.data.get()).write(value) };
        slot.ready.store(true, Ordering::Release);
        self.local_head = self.local_head.wrapping_add(1);
        Ok(())
    }

    /// Attempts to send a value without blocking.
    ///
    /// Returns `Err(TrySendError::Full(value))` if the target slot is
    /// occupied (the queue is full; for this single-producer variant that is
    /// a firm statement) or `Err(TrySendError::Closed(value))` if
    /// closed.
    pub fn try_send(&mut self, value: T) -> Result<(), TrySendError<T>> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return Err(TrySendError::Closed(value));
        }

        let slot = unsafe { &*inner.buffer.add(self.local_head & inner.mask) };
        if slot.ready.load(Ordering::Acquire) {
            return Err(TrySendError::Full(value));
        }

        unsafe { (*slot.data.get()).write(value) };
        slot.ready.store(true, Ordering::Release);
        self.local_head = self.local_head.wrapping_add(1);
        Ok(())
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
    /// Our read position. Never shared.
    local_tail: usize,
    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, blocking while its slot is empty.
    ///
    /// Returns `Err(RecvError)` if the queue is closed.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        self.recv_deadline(Duration::ZERO).map_err(|_| RecvError)
    }

    /// Receives the next value, giving up after `timeout`.
    ///
    /// A zero timeout waits indefinitely. The deadline is measured from a
    /// single timestamp taken at the start of the call.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_deadline(timeout)
    }

    fn recv_deadline(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let inner = &*self.inner;
        let start = (timeout > Duration::ZERO).then(Instant::now);
        let slot = unsafe { &*inner.buffer.add(self.local_tail & inner.mask) };

        loop {
            if inner.closed.is_closed() {
                return Err(RecvTimeoutError::Closed);
            }
            if slot.ready.load(Ordering::Acquire) {
                break;
            }
            if let Some(start) = start {
                if start.elapsed() >= timeout {
                    return Err(RecvTimeoutError::Timeout);
                }
            }
            thread::yield_now();
        }

        // Move the payload out before handing the slot back
        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.ready.store(false, Ordering::Release);
        self.local_tail = self.local_tail.wrapping_add(1);
        Ok(value)
    }

    /// Attempts to receive a value without blocking.
    ///
    /// Returns `None` if the queue is empty or closed.
    pub fn try_recv(&mut self) -> Option<T> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return None;
        }

        let slot = unsafe { &*inner.buffer.add(self.local_tail & inner.mask) };
        if !slot.ready.load(Ordering::Acquire) {
            return None;
        }

        let value = unsafe { (*slot.data.get()).assume_init_read() };
        slot.ready.store(false, Ordering::Release);
        self.local_tail = self.local_tail.wrapping_add(1);
        Some(value)
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

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
