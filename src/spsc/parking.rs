//! Single-producer single-consumer queue with per-slot semaphores and
//! OS park/unpark.
//!
//! Every other family member busy-waits with a scheduler yield; this one
//! sleeps. Each slot carries a pair of counting semaphores: available
//! writes (initially 1) and available reads (initially 0). An endpoint
//! whose decrement goes negative parks its thread; the peer's increment,
//! observing a waiter, unparks it. [`Parker`]'s token semantics make the
//! wake race-free: an unpark delivered before the park call is not lost.
//!
//! Sleeping trades latency for idle-friendliness: a parked thread costs
//! nothing, where a yielding one keeps its core warm. Prefer this variant
//! when traffic is bursty and cores are shared; prefer the yielding
//! variants when every nanosecond of wake latency counts.
//!
//! The surface is blocking-only: no `try_send`, no timed receive.
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use lockring::spsc::parking;
//!
//! let (mut tx, mut rx) = parking::channel::<u64>(64);
//!
//! thread::spawn(move || {
//!     tx.send(42).unwrap();
//! });
//!
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_utils::CachePadded;
use crossbeam_utils::sync::{Parker, Unparker};

use crate::{CloseFlag, RecvError, SendError};

/// Creates a new parking SPSC queue with the given capacity.
///
/// The actual capacity is rounded up to the next power of two.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let capacity = capacity.next_power_of_two();

    let mut slots = ManuallyDrop::new(Vec::<Slot<T>>::with_capacity(capacity));
    for _ in 0..capacity {
        slots.push(Slot {
            sema: CachePadded::new(SlotSemas {
                writes: AtomicI32::new(1),
                reads: AtomicI32::new(0),
            }),
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

    let sender_parker = Parker::new();
    let receiver_parker = Parker::new();
    let sender_unparker = sender_parker.unparker().clone();
    let receiver_unparker = receiver_parker.unparker().clone();

    (
        Sender {
            local_head: 0,
            parker: sender_parker,
            peer: receiver_unparker,
            inner: Arc::clone(&inner),
        },
        Receiver {
            local_tail: 0,
            parker: receiver_parker,
            peer: sender_unparker,
            inner,
        },
    )
}

/// Per-slot semaphore pair. Padded away from the payload so the
/// coordination words and the data don't fight over a line.
struct SlotSemas {
    /// Available writes: 1 while the slot is free for the producer.
    writes: AtomicI32,
    /// Available reads: 1 while the slot holds a value.
    reads: AtomicI32,
}

#[repr(C)]
struct Slot<T> {
    sema: CachePadded<SlotSemas>,
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
        // A positive read semaphore marks a slot with an un-consumed value
        for i in 0..self.capacity {
            let slot = unsafe { &*self.buffer.add(i) };
            if slot.sema.reads.load(Ordering::Relaxed) > 0 {
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
    local_head: usize,
    parker: Parker,
    peer: Unparker,
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Sends a value, parking the thread while the target slot is
    /// occupied.
    ///
    /// Returns `Err(SendError(value))` if the queue is closed, observed at
    /// entry or on wake.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return Err(SendError(value));
        }

        let slot = unsafe { &*inner.buffer.add(self.local_head & inner.mask) };

        // Semaphore wait: a non-positive previous value means the slot is
        // still occupied and the consumer will wake us
        if slot.sema.writes.fetch_sub(1, Ordering::AcqRel) < 1 {
            self.parker.park();
            if inner.closed.is_closed_sync() {
                return Err(SendError(value));
            }
        }

        unsafe { (*slot.data.get()).write(value) };
        self.local_head = self.local_head.wrapping_add(1);

        // Semaphore signal: a negative previous value means the consumer
        // is parked (or about to park) on this slot
        if slot.sema.reads.fetch_add(1, Ordering::AcqRel) < 0 {
            self.peer.unpark();
        }
        Ok(())
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Closes the queue and wakes the peer if it is parked. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.close() {
            self.peer.unpark();
        }
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
    local_tail: usize,
    parker: Parker,
    peer: Unparker,
    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, parking the thread while its slot is
    /// empty.
    ///
    /// Returns `Err(RecvError)` if the queue is closed, observed at entry
    /// or on wake.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return Err(RecvError);
        }

        let slot = unsafe { &*inner.buffer.add(self.local_tail & inner.mask) };

        if slot.sema.reads.fetch_sub(1, Ordering::AcqRel) < 1 {
            self.parker.park();
            if inner.closed.is_closed_sync() {
                return Err(RecvError);
            }
        }

        let value = unsafe { (*slot.data.get()).assume_init_read() };
        self.local_tail = self.local_tail.wrapping_add(1);

        if slot.sema.writes.fetch_add(1, Ordering::AcqRel) < 0 {
            self.peer.unpark();
        }
        Ok(value)
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Closes the queue and wakes the peer if it is parked. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.close() {
            self.peer.unpark();
        }
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn basic_send_recv() {
        let (mut tx, mut rx) = channel::<u64>(8);

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[test]
    fn fill_to_capacity_without_consumer() {
        let (mut tx, _rx) = channel::<u64>(4);

        // All four slots have a free write semaphore; no parking involved
        for i in 0..4 {
            tx.send(i).unwrap();
        }
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let (tx, _rx) = channel::<u64>(5);
        assert_eq!(tx.capacity(), 8);

        let (tx, _rx) = channel::<u64>(64);
        assert_eq!(tx.capacity(), 64);
    }

    #[test]
    fn parked_receiver_is_woken_by_send() {
        let (mut tx, mut rx) = channel::<u64>(8);

        let handle = thread::spawn(move || rx.recv());

        // Let the receiver park on the empty slot
        thread::sleep(Duration::from_millis(20));
        tx.send(99).unwrap();

        assert_eq!(handle.join().unwrap(), Ok(99));
    }

    #[test]
    fn parked_sender_is_woken_by_recv() {
        let (mut tx, mut rx) = channel::<u64>(1);
        tx.send(1).unwrap();

        let handle = thread::spawn(move || tx.send(2));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.recv().unwrap(), 1);

        handle.join().unwrap().unwrap();
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn close_wakes_parked_receiver() {
        let (tx, mut rx) = channel::<u64>(4);

        let handle = thread::spawn(move || rx.recv());

        thread::sleep(Duration::from_millis(20));
        tx.close();

        assert_eq!(handle.join().unwrap(), Err(RecvError));
    }

    #[test]
    fn close_wakes_parked_sender() {
        let (mut tx, rx) = channel::<u64>(1);
        tx.send(1).unwrap();

        let handle = thread::spawn(move || tx.send(2));

        thread::sleep(Duration::from_millis(20));
        rx.close();

        assert_eq!(handle.join().unwrap(), Err(SendError(2)));
    }

    #[test]
    fn drop_remaining_items() {
        let drop_count = Arc::new(AtomicUsize::new(0));

        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (mut tx, mut rx) = channel::<DropCounter>(8);

        tx.send(DropCounter(Arc::clone(&drop_count))).unwrap();
        tx.send(DropCounter(Arc::clone(&drop_count))).unwrap();

        let _ = rx.recv().unwrap();
        assert_eq!(drop_count.load(Ordering::SeqCst), 1);

        drop(tx);
        drop(rx);
        assert_eq!(drop_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stress_sum_verification() {
        const COUNT: u64 = 100_000;
        const EXPECTED_SUM: u64 = COUNT * (COUNT - 1) / 2;

        let (mut tx, mut rx) = channel::<u64>(256);

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                tx.send(i).unwrap();
            }
        });

        let consumer = thread::spawn(move || {
            let mut sum = 0u64;
            for _ in 0..COUNT {
                sum = sum.wrapping_add(rx.recv().unwrap());
            }
            sum
        });

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), EXPECTED_SUM);
    }
}
