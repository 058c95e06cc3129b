//! Single-producer single-consumer queue with plain shared counters.
//!
//! The simplest member of the SPSC family: a shared write counter owned by
//! the producer and a shared read counter owned by the consumer. Each side
//! re-reads the peer's counter on every attempt, so every hot-path
//! iteration costs one acquire load of a foreign cache line. The
//! [`cached`](super::cached) variant removes most of those loads; this one
//! is the baseline.
//!
//! Because each counter has exactly one writer, advancement is a plain
//! release store; no compare-and-swap is needed anywhere.
//!
//! # Example
//!
//! ```
//! use lockring::spsc::counter;
//!
//! let (mut tx, mut rx) = counter::channel::<u64>(8);
//!
//! tx.send(1).unwrap();
//! tx.send(2).unwrap();
//!
//! assert_eq!(rx.recv().unwrap(), 1);
//! assert_eq!(rx.recv().unwrap(), 2);
//! ```

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::{CloseFlag, RecvError, RecvTimeoutError, SendError, TrySendError};

/// Creates a new SPSC queue with the given capacity.
///
/// The actual capacity is rounded up to the next power of two for efficient
/// index masking.
///
/// # Example
///
/// ```
/// use lockring::spsc::counter;
///
/// let (tx, _rx) = counter::channel::<String>(100);
/// assert_eq!(tx.capacity(), 128);
/// ```
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let capacity = capacity.next_power_of_two();
    let buffer = ManuallyDrop::new(Vec::<T>::with_capacity(capacity)).as_mut_ptr();

    let inner = Arc::new(Inner {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
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

/// Shared state between producer and consumer.
#[repr(C)]
struct Inner<T> {
    // === Separate cache lines (CachePadded handles this) ===
    /// Producer's write position.
    head: CachePadded<AtomicUsize>,
    /// Consumer's read position.
    tail: CachePadded<AtomicUsize>,

    /// One-way close flag, checked at the top of every retry.
    closed: CloseFlag,

    // === Immutable after construction ===
    buffer: *mut T,
    capacity: usize,
    mask: usize,
}

// Safety: the counters carry the synchronization; producer and consumer
// each write only their own index.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Drop any remaining elements in [tail, head)
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);

        let mut i = tail;
        while i != head {
            unsafe {
                self.buffer.add(i & self.mask).drop_in_place();
            }
            i = i.wrapping_add(1);
        }

        // Reconstruct and drop the Vec to free memory
        unsafe {
            let _ = Vec::from_raw_parts(self.buffer, 0, self.capacity);
        }
    }
}

/// The sending half of the queue.
///
/// Takes `&mut self` to statically ensure single-producer access; the
/// handle itself moves freely between threads.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Sends a value, blocking while the queue is full.
    ///
    /// Blocks by yielding to the scheduler between attempts. Returns
    /// `Err(SendError(value))` if the queue is closed, handing the value
    /// back.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);

        loop {
            if inner.closed.is_closed() {
                return Err(SendError(value));
            }
            let tail = inner.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) < inner.capacity {
                break;
            }
            thread::yield_now();
        }

        unsafe {
            inner.buffer.add(head & inner.mask).write(value);
        }
        inner.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Attempts to send a value without blocking.
    ///
    /// Returns `Err(TrySendError::Full(value))` if the queue is full
    /// (for this single-producer variant that is a firm statement, not a
    /// race artifact) or `Err(TrySendError::Closed(value))` if closed.
    ///
    /// # Example
    ///
    /// ```
    /// use lockring::TrySendError;
    /// use lockring::spsc::counter;
    ///
    /// let (mut tx, _rx) = counter::channel::<u32>(2);
    ///
    /// tx.try_send(1).unwrap();
    /// tx.try_send(2).unwrap();
    /// assert!(matches!(tx.try_send(3), Err(TrySendError::Full(3))));
    /// ```
    pub fn try_send(&mut self, value: T) -> Result<(), TrySendError<T>> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return Err(TrySendError::Closed(value));
        }

        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= inner.capacity {
            return Err(TrySendError::Full(value));
        }

        unsafe {
            inner.buffer.add(head & inner.mask).write(value);
        }
        inner.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
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
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Returns `true` if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The receiving half of the queue.
///
/// Takes `&mut self` to statically ensure single-consumer access; the
/// handle itself moves freely between threads.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, blocking while the queue is empty.
    ///
    /// Returns `Err(RecvError)` if the queue is closed.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        self.recv_deadline(Duration::ZERO).map_err(|_| RecvError)
    }

    /// Receives the next value, giving up after `timeout`.
    ///
    /// A zero timeout waits indefinitely. The deadline is measured from a
    /// single timestamp taken at the start of the call.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use lockring::RecvTimeoutError;
    /// use lockring::spsc::counter;
    ///
    /// let (_tx, mut rx) = counter::channel::<u32>(4);
    /// let err = rx.recv_timeout(Duration::from_millis(5)).unwrap_err();
    /// assert_eq!(err, RecvTimeoutError::Timeout);
    /// ```
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_deadline(timeout)
    }

    fn recv_deadline(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let inner = &*self.inner;
        let start = (timeout > Duration::ZERO).then(Instant::now);
        let tail = inner.tail.load(Ordering::Relaxed);

        loop {
            if inner.closed.is_closed() {
                return Err(RecvTimeoutError::Closed);
            }
            let head = inner.head.load(Ordering::Acquire);
            if tail != head {
                break;
            }
            if let Some(start) = start {
                if start.elapsed() >= timeout {
                    return Err(RecvTimeoutError::Timeout);
                }
            }
            thread::yield_now();
        }

        let value = unsafe { inner.buffer.add(tail & inner.mask).read() };
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
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

        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let value = unsafe { inner.buffer.add(tail & inner.mask).read() };
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
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
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Returns `true` if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    // ============================================================================
    // Basic Operations
    // ============================================================================

    #[test]
    fn fill_then_drain() {
        let (mut tx, mut rx) = channel::<u64>(4);

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        tx.send(4).unwrap();

        // Full: a fifth offer is refused deterministically
        assert!(matches!(tx.try_send(5), Err(TrySendError::Full(5))));

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
        assert_eq!(rx.recv().unwrap(), 4);

        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn send_recv_interleaved() {
        let (mut tx, mut rx) = channel::<u64>(8);

        for i in 0..100 {
            tx.send(i).unwrap();
            assert_eq!(rx.recv().unwrap(), i);
        }
    }

    // ============================================================================
    // Capacity and Rounding
    // ============================================================================

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let (tx, _rx) = channel::<u64>(5);
        assert_eq!(tx.capacity(), 8);

        let (tx, _rx) = channel::<u64>(1);
        assert_eq!(tx.capacity(), 1);

        let (tx, _rx) = channel::<u64>(0);
        assert_eq!(tx.capacity(), 1);

        let (tx, _rx) = channel::<u64>(1024);
        assert_eq!(tx.capacity(), 1024);
    }

    #[test]
    fn single_capacity() {
        let (mut tx, mut rx) = channel::<u64>(1);
        assert_eq!(tx.capacity(), 1);

        tx.send(1).unwrap();
        assert!(matches!(tx.try_send(2), Err(TrySendError::Full(2))));

        assert_eq!(rx.recv().unwrap(), 1);
        tx.send(2).unwrap();
        assert_eq!(rx.recv().unwrap(), 2);
    }

    // ============================================================================
    // Index Wrapping
    // ============================================================================

    #[test]
    fn multiple_wraparounds() {
        let (mut tx, mut rx) = channel::<u64>(4);

        for lap in 0..100 {
            for i in 0..4 {
                tx.send(lap * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(rx.recv().unwrap(), lap * 4 + i);
            }
        }
    }

    // ============================================================================
    // Close
    // ============================================================================

    #[test]
    fn close_fails_subsequent_operations() {
        let (mut tx, mut rx) = channel::<u64>(4);
        tx.send(1).unwrap();

        rx.close();
        assert!(rx.is_closed());
        assert!(tx.is_closed());

        assert_eq!(tx.send(2), Err(SendError(2)));
        assert!(matches!(tx.try_send(3), Err(TrySendError::Closed(3))));
        assert_eq!(rx.recv(), Err(RecvError));

        // Idempotent
        rx.close();
        tx.close();
        assert_eq!(rx.recv(), Err(RecvError));
    }

    #[test]
    fn close_wakes_blocked_sender() {
        let (mut tx, rx) = channel::<u64>(1);
        tx.send(1).unwrap();

        let handle = thread::spawn(move || tx.send(2));

        // Give the sender time to block on the full queue
        thread::sleep(Duration::from_millis(20));
        rx.close();

        assert_eq!(handle.join().unwrap(), Err(SendError(2)));
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let (tx, mut rx) = channel::<u64>(4);

        let handle = thread::spawn(move || rx.recv());

        thread::sleep(Duration::from_millis(20));
        tx.close();

        assert_eq!(handle.join().unwrap(), Err(RecvError));
    }

    // ============================================================================
    // Timeouts
    // ============================================================================

    #[test]
    fn recv_timeout_elapses() {
        let (_tx, mut rx) = channel::<u64>(4);

        let timeout = Duration::from_millis(10);
        let start = Instant::now();
        let err = rx.recv_timeout(timeout).unwrap_err();

        assert_eq!(err, RecvTimeoutError::Timeout);
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn zero_timeout_waits_for_data() {
        let (mut tx, mut rx) = channel::<u64>(4);

        let handle = thread::spawn(move || rx.recv_timeout(Duration::ZERO));

        thread::sleep(Duration::from_millis(10));
        tx.send(7).unwrap();

        assert_eq!(handle.join().unwrap(), Ok(7));
    }

    // ============================================================================
    // Drop Handling
    // ============================================================================

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
        tx.send(DropCounter(Arc::clone(&drop_count))).unwrap();

        assert_eq!(drop_count.load(Ordering::SeqCst), 0);

        let _ = rx.recv().unwrap();
        assert_eq!(drop_count.load(Ordering::SeqCst), 1);

        drop(tx);
        drop(rx);
        assert_eq!(drop_count.load(Ordering::SeqCst), 3);
    }

    // ============================================================================
    // Cross-Thread
    // ============================================================================

    #[test]
    fn cross_thread_ordering() {
        let (mut tx, mut rx) = channel::<u64>(16);

        let producer = thread::spawn(move || {
            for i in 0..10_000 {
                tx.send(i).unwrap();
            }
        });

        let consumer = thread::spawn(move || {
            for i in 0..10_000 {
                assert_eq!(rx.recv().unwrap(), i);
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn stress_sum_verification() {
        const COUNT: u64 = 500_000;
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

    // ============================================================================
    // Special Types
    // ============================================================================

    #[test]
    fn string_messages() {
        let (mut tx, mut rx) = channel::<String>(8);

        tx.send("hello".to_string()).unwrap();
        tx.send("world".to_string()).unwrap();

        assert_eq!(rx.recv().unwrap(), "hello");
        assert_eq!(rx.recv().unwrap(), "world");
    }

    #[test]
    fn zero_sized_type() {
        let (mut tx, mut rx) = channel::<()>(8);

        tx.send(()).unwrap();
        tx.send(()).unwrap();

        assert_eq!(rx.recv().unwrap(), ());
        assert_eq!(rx.recv().unwrap(), ());
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn len_and_is_empty() {
        let (mut tx, mut rx) = channel::<u64>(4);

        assert!(rx.is_empty());

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(rx.len(), 2);
        assert_eq!(tx.len(), 2);

        let _ = rx.recv().unwrap();
        let _ = rx.recv().unwrap();
        assert!(tx.is_empty());
    }
}
