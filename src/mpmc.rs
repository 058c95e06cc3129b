//! Multi-producer multi-consumer bounded queue with sequenced slots.
//!
//! Dmitry Vyukov's bounded MPMC design: each slot carries a sequence
//! number that encodes which lap it belongs to and whether it is readable
//! or writable. Producers race on a shared write counter, consumers on a
//! shared read counter, both via compare-and-swap; the per-slot sequence
//! is the publication point that transfers slot ownership.
//!
//! Slot states for position `pos` in a ring of `N` slots:
//!
//! - `sequence == pos`: empty, claimable by the producer at `pos`
//! - `sequence == pos + 1`: full, claimable by the consumer at `pos`
//! - `sequence == pos + N`: recycled, claimable by next lap's producer
//!
//! Both handles are cloneable; any number of threads may send and receive
//! concurrently. FIFO order is the linearization order of the counter
//! CAS wins.
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use lockring::mpmc;
//!
//! let (tx, rx) = mpmc::channel::<u64>(1024);
//!
//! let tx2 = tx.clone();
//! let h1 = thread::spawn(move || tx.send(1).unwrap());
//! let h2 = thread::spawn(move || tx2.send(2).unwrap());
//!
//! let a = rx.recv().unwrap();
//! let b = rx.recv().unwrap();
//! assert_eq!(a + b, 3);
//!
//! h1.join().unwrap();
//! h2.join().unwrap();
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::{CloseFlag, RecvError, RecvTimeoutError, SendError, TrySendError};

/// Creates a new MPMC queue with the given capacity.
///
/// The actual capacity is rounded up to the next power of two, with a
/// minimum of 2: the sequence arithmetic tags a readable slot with
/// `pos + 1`, which a one-slot ring cannot distinguish from the next
/// lap's writable state.
///
/// # Example
///
/// ```
/// use lockring::mpmc;
///
/// let (tx, _rx) = mpmc::channel::<String>(100);
/// assert_eq!(tx.capacity(), 128);
///
/// let (tx, _rx) = mpmc::channel::<String>(1);
/// assert_eq!(tx.capacity(), 2);
/// ```
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let capacity = capacity.next_power_of_two().max(2);

    let mut slots = ManuallyDrop::new(Vec::<Slot<T>>::with_capacity(capacity));
    for i in 0..capacity {
        slots.push(Slot {
            sequence: AtomicUsize::new(i),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        });
    }
    let buffer = slots.as_mut_ptr();

    let inner = Arc::new(Inner {
        write: CachePadded::new(AtomicUsize::new(0)),
        read: CachePadded::new(AtomicUsize::new(0)),
        closed: CloseFlag::new(),
        buffer,
        capacity,
        mask: capacity - 1,
    });

    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver { inner },
    )
}

/// A slot in the sequenced ring.
#[repr(C)]
struct Slot<T> {
    sequence: AtomicUsize,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Shared state among all producers and consumers.
#[repr(C)]
struct Inner<T> {
    /// Producers' claim counter, advanced by CAS.
    write: CachePadded<AtomicUsize>,
    /// Consumers' claim counter, advanced by CAS.
    read: CachePadded<AtomicUsize>,

    closed: CloseFlag,

    // === Immutable after construction ===
    buffer: *mut Slot<T>,
    capacity: usize,
    mask: usize,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    #[inline]
    fn slot(&self, pos: usize) -> &Slot<T> {
        unsafe { &*self.buffer.add(pos & self.mask) }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Drop slots in [read, write) whose sequence marks them published
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Relaxed);

        let mut i = read;
        while i != write {
            let slot = self.slot(i);
            if slot.sequence.load(Ordering::Relaxed) == i.wrapping_add(1) {
                unsafe { (*slot.data.get()).assume_init_drop() };
            }
            i = i.wrapping_add(1);
        }

        unsafe {
            let _ = Vec::from_raw_parts(self.buffer, self.capacity, self.capacity);
        }
    }
}

/// A sequence observation no correct execution can produce: the slot is
/// more than two laps behind its claimant. The ring's memory is
/// compromised, so this does not unwind; it takes the process down.
#[cold]
#[inline(never)]
fn sequence_corrupted(op: &str) -> ! {
    eprintln!("lockring: ring buffer in a compromised state during a {op} operation");
    std::process::abort()
}

/// The sending half of the queue.
///
/// Cloneable; any number of producers may send concurrently from `&self`.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Sends a value, blocking while the queue is full.
    ///
    /// Blocks by yielding to the scheduler between attempts. Returns
    /// `Err(SendError(value))` if the queue is closed.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let inner = &*self.inner;
        let mut pos = inner.write.load(Ordering::Relaxed);

        loop {
            if inner.closed.is_closed() {
                return Err(SendError(value));
            }

            let slot = inner.slot(pos);
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                // Slot is writable at our position; race for the claim
                match inner.write.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.data.get()).write(value) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // A sequence trails its claimant by under two laps in any
                // correct execution, even mid-publication
                if diff < -2 * inner.capacity as isize {
                    sequence_corrupted("send");
                }
                // Last lap's value still occupies the slot: the ring is full
            } else {
                // A faster producer claimed this position; chase the counter
                pos = inner.write.load(Ordering::Relaxed);
            }

            thread::yield_now();
        }
    }

    /// Attempts to send a value with a single claim attempt.
    ///
    /// Returns `Err(TrySendError::Full(value))` whenever the attempt
    /// cannot complete. With concurrent producers this is **not** proof
    /// of fullness: a racing producer that just claimed the same position
    /// produces the same outcome. Callers that need firm fullness
    /// detection should use a single-producer variant.
    ///
    /// Returns `Err(TrySendError::Closed(value))` if the queue is closed.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return Err(TrySendError::Closed(value));
        }

        let pos = inner.write.load(Ordering::Relaxed);
        let slot = inner.slot(pos);
        let seq = slot.sequence.load(Ordering::Acquire);
        let diff = seq.wrapping_sub(pos) as isize;

        if diff == 0 {
            if inner
                .write
                .compare_exchange(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                unsafe { (*slot.data.get()).write(value) };
                slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                return Ok(());
            }
        } else if diff < -2 * inner.capacity as isize {
            sequence_corrupted("send");
        }

        Err(TrySendError::Full(value))
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns the number of elements currently in the queue.
    ///
    /// Note: This is a snapshot and may be immediately stale.
    #[inline]
    pub fn len(&self) -> usize {
        let write = self.inner.write.load(Ordering::Relaxed);
        let read = self.inner.read.load(Ordering::Relaxed);
        write.wrapping_sub(read)
    }

    /// Returns `true` if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue. Idempotent; every blocked producer and consumer
    /// observes closure within a scheduling quantum.
    pub fn close(&self) {
        self.inner.closed.close();
    }

    /// Returns `true` if the queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The receiving half of the queue.
///
/// Cloneable; any number of consumers may receive concurrently from
/// `&self`. Each value is delivered to exactly one consumer.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, blocking while the queue is empty.
    ///
    /// Returns `Err(RecvError)` if the queue is closed.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.recv_deadline(Duration::ZERO).map_err(|_| RecvError)
    }

    /// Receives the next value, giving up after `timeout`.
    ///
    /// A zero timeout waits indefinitely. The deadline is measured from a
    /// single timestamp taken at the start of the call.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_deadline(timeout)
    }

    fn recv_deadline(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let inner = &*self.inner;
        let start = (timeout > Duration::ZERO).then(Instant::now);
        let mut pos = inner.read.load(Ordering::Relaxed);

        loop {
            if inner.closed.is_closed() {
                return Err(RecvTimeoutError::Closed);
            }

            let slot = inner.slot(pos);
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                // Slot is readable at our position; race for the claim
                match inner.read.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.data.get()).assume_init_read() };
                        // Recycle for next lap's producer
                        slot.sequence
                            .store(pos.wrapping_add(inner.capacity), Ordering::Release);
                        return Ok(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // A sequence trails its claimant by under two laps in any
                // correct execution, even mid-publication
                if diff < -2 * inner.capacity as isize {
                    sequence_corrupted("recv");
                }
                // Nothing published at our position yet: the ring is empty
            } else {
                // A faster consumer claimed this position; chase the counter
                pos = inner.read.load(Ordering::Relaxed);
            }

            if let Some(start) = start {
                if start.elapsed() >= timeout {
                    return Err(RecvTimeoutError::Timeout);
                }
            }
            thread::yield_now();
        }
    }

    /// Attempts to receive a value with a single claim attempt.
    ///
    /// Returns `None` whenever the attempt cannot complete: the queue is
    /// empty, closed, or a racing consumer claimed the same position. As
    /// with [`Sender::try_send`], `None` under contention is not proof of
    /// emptiness.
    pub fn try_recv(&self) -> Option<T> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return None;
        }

        let pos = inner.read.load(Ordering::Relaxed);
        let slot = inner.slot(pos);
        let seq = slot.sequence.load(Ordering::Acquire);
        let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

        if diff == 0 {
            if inner
                .read
                .compare_exchange(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let value = unsafe { (*slot.data.get()).assume_init_read() };
                slot.sequence
                    .store(pos.wrapping_add(inner.capacity), Ordering::Release);
                return Some(value);
            }
        } else if diff < -2 * inner.capacity as isize {
            sequence_corrupted("recv");
        }

        None
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns the number of elements currently in the queue.
    ///
    /// Note: This is a snapshot and may be immediately stale.
    #[inline]
    pub fn len(&self) -> usize {
        let write = self.inner.write.load(Ordering::Relaxed);
        let read = self.inner.read.load(Ordering::Relaxed);
        write.wrapping_sub(read)
    }

    /// Returns `true` if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue. Idempotent; every blocked producer and consumer
    /// observes closure within a scheduling quantum.
    pub fn close(&self) {
        self.inner.closed.close();
    }

    /// Returns `true` if the queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
