//! Single-producer single-consumer queue with cached peer counters.
//!
//! The default SPSC variant. Each endpoint keeps its own position in a
//! plain (non-shared) field plus a cached snapshot of the peer's shared
//! counter. The hot path checks the snapshot only: as long as the last
//! refresh already proves the queue non-full (producer) or non-empty
//! (consumer), no foreign cache line is touched. The shared peer counter
//! is re-read only when the cache says otherwise.
//!
//! Each successful operation publishes the endpoint's own counter with a
//! release store, so the peer's next refresh always observes it. That
//! per-operation publication is what keeps the queue live under low
//! traffic; contrast with [`batched`](super::batched), which defers
//! publication and stalls.
//!
//! # Example
//!
//! ```
//! use lockring::spsc;
//!
//! let (mut tx, mut rx) = spsc::channel::<u64>(1024);
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
/// The actual capacity is rounded up to the next power of two.
///
/// # Example
///
/// ```
/// use lockring::spsc::cached;
///
/// let (tx, _rx) = cached::channel::<String>(100);
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
            local_head: 0,
            cached_tail: 0,
            inner: Arc::clone(&inner),
        },
        Receiver {
            local_tail: 0,
            cached_head: 0,
            inner,
        },
    )
}

/// Shared state between producer and consumer.
#[repr(C)]
struct Inner<T> {
    /// Producer's published write position.
    head: CachePadded<AtomicUsize>,
    /// Consumer's published read position.
    tail: CachePadded<AtomicUsize>,

    closed: CloseFlag,

    // === Immutable after construction ===
    buffer: *mut T,
    capacity: usize,
    mask: usize,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Publication is per-operation, so the shared counters are exact
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
/// Takes `&mut self` to statically ensure single-producer access; the
/// handle itself moves freely between threads.
pub struct Sender<T> {
    /// Our write position (authoritative; the shared counter trails by at
    /// most the current in-flight operation).
    local_head: usize,
    /// Cached snapshot of the consumer's read position, refreshed only
    /// when the queue appears full.
    cached_tail: usize,

    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Sends a value, blocking while the queue is full.
    ///
    /// On the fast path this performs no shared loads besides the close
    /// flag; the consumer's counter is consulted only when the cached
    /// snapshot shows the queue full.
    ///
    /// Returns `Err(SendError(value))` if the queue is closed.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        let inner = &*self.inner;
        let head = self.local_head;

        loop {
            if inner.closed.is_closed() {
                return Err(SendError(value));
            }
            if head.wrapping_sub(self.cached_tail) < inner.capacity {
                break;
            }
            // Cache shows full: refresh from the shared counter
            self.cached_tail = inner.tail.load(Ordering::Acquire);
            if head.wrapping_sub(self.cached_tail) < inner.capacity {
                break;
            }
            thread::yield_now();
        }

        unsafe {
            inner.buffer.add(head & inner.mask).write(value);
        }
        let next_head = head.wrapping_add(1);
        inner.head.store(next_head, Ordering::Release);
        self.local_head = next_head;
        Ok(())
    }

    /// Attempts to send a value without blocking.
    ///
    /// Returns `Err(TrySendError::Full(value))` if the queue is full (a
    /// firm statement for this single-producer variant) or
    /// `Err(TrySendError::Closed(value))` if closed.
    ///
    /// # Example
    ///
    /// ```
    /// use lockring::TrySendError;
    /// use lockring::spsc::cached;
    ///
    /// let (mut tx, _rx) = cached::channel::<u32>(2);
    ///
    /// tx.try_send(1).unwrap();
    /// tx.try_send(2).unwrap();
    /// assert!(matches!(tx.try_send(3), Err(TrySendError::Full(3))));
    /// ```
    #[inline]
    pub fn try_send(&mut self, value: T) -> Result<(), TrySendError<T>> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return Err(TrySendError::Closed(value));
        }

        let head = self.local_head;
        if head.wrapping_sub(self.cached_tail) < inner.capacity {
            unsafe {
                inner.buffer.add(head & inner.mask).write(value);
            }
            let next_head = head.wrapping_add(1);
            inner.head.store(next_head, Ordering::Release);
            self.local_head = next_head;
            return Ok(());
        }

        self.try_send_slow(value)
    }

    #[cold]
    fn try_send_slow(&mut self, value: T) -> Result<(), TrySendError<T>> {
        let inner = &*self.inner;
        let head = self.local_head;

        self.cached_tail = inner.tail.load(Ordering::Acquire);
        if head.wrapping_sub(self.cached_tail) >= inner.capacity {
            return Err(TrySendError::Full(value));
        }

        unsafe {
            inner.buffer.add(head & inner.mask).write(value);
        }
        let next_head = head.wrapping_add(1);
        inner.head.store(next_head, Ordering::Release);
        self.local_head = next_head;
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
    /// Our read position (authoritative).
    local_tail: usize,
    /// Cached snapshot of the producer's write position, refreshed only
    /// when the queue appears empty.
    cached_head: usize,

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
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.recv_deadline(timeout)
    }

    fn recv_deadline(&mut self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let inner = &*self.inner;
        let start = (timeout > Duration::ZERO).then(Instant::now);
        let tail = self.local_tail;

        loop {
            if inner.closed.is_closed() {
                return Err(RecvTimeoutError::Closed);
            }
            if tail != self.cached_head {
                break;
            }
            // Cache shows empty: refresh from the shared counter
            self.cached_head = inner.head.load(Ordering::Acquire);
            if tail != self.cached_head {
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
        let next_tail = tail.wrapping_add(1);
        inner.tail.store(next_tail, Ordering::Release);
        self.local_tail = next_tail;
        Ok(value)
    }

    /// Attempts to receive a value without blocking.
    ///
    /// Returns `None` if the queue is empty or closed.
    #[inline]
    pub fn try_recv(&mut self) -> Option<T> {
        let inner = &*self.inner;
        if inner.closed.is_closed() {
            return None;
        }

        let tail = self.local_tail;
        if tail != self.cached_head {
            let value = unsafe { inner.buffer.add(tail & inner.mask).read() };
            let next_tail = tail.wrapping_add(1);
            inner.tail.store(next_tail, Ordering::Release);
            self.local_tail = next_tail;
            return Some(value);
        }

        self.try_recv_slow()
    }

    #[cold]
    fn try_recv_slow(&mut self) -> Option<T> {
        let inner = &*self.inner;
        let tail = self.local_tail;

        self.cached_head = inner.head.load(Ordering::Acquire);
        if tail == self.cached_head {
            return None;
        }

        let value = unsafe { inner.buffer.add(tail & inner.mask).read() };
        let next_tail = tail.wrapping_add(1);
        inner.tail.store(next_tail, Ordering::Release);
        self.local_tail = next_tail;
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

    #[test]
    fn basic_send_recv() {
        let (mut tx, mut rx) = channel::<u64>(8);

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let (tx, _rx) = channel::<u64>(5);
        assert_eq!(tx.capacity(), 8);

        let (tx, _rx) = channel::<u64>(1);
        assert_eq!(tx.capacity(), 1);

        let (tx, _rx) = channel::<u64>(1024);
        assert_eq!(tx.capacity(), 1024);
    }

    #[test]
    fn full_queue_refuses_offer() {
        let (mut tx, mut rx) = channel::<u64>(4);

        for i in 0..4 {
            tx.try_send(i).unwrap();
        }
        assert!(matches!(tx.try_send(4), Err(TrySendError::Full(4))));

        // Draining through the peer makes room visible after a refresh
        assert_eq!(rx.recv().unwrap(), 0);
        tx.try_send(4).unwrap();
    }

    #[test]
    fn cache_refresh_after_full_drain() {
        let (mut tx, mut rx) = channel::<u64>(4);

        // Fill, drain, fill again: the second fill must refresh the
        // producer's stale snapshot of the consumer
        for lap in 0..50 {
            for i in 0..4 {
                tx.send(lap * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(rx.recv().unwrap(), lap * 4 + i);
            }
        }
    }

    #[test]
    fn close_wakes_blocked_sender() {
        let (mut tx, rx) = channel::<u64>(1);
        tx.send(1).unwrap();

        let handle = thread::spawn(move || tx.send(2));

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

    #[test]
    fn recv_timeout_elapses() {
        let (_tx, mut rx) = channel::<u64>(4);

        let timeout = Duration::from_millis(10);
        let start = Instant::now();
        assert_eq!(rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout));
        assert!(start.elapsed() >= timeout);
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

        let (mut tx, rx) = channel::<DropCounter>(8);

        tx.send(DropCounter(Arc::clone(&drop_count))).unwrap();
        tx.send(DropCounter(Arc::clone(&drop_count))).unwrap();

        assert_eq!(drop_count.load(Ordering::SeqCst), 0);

        drop(tx);
        drop(rx);
        assert_eq!(drop_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stress_sum_verification() {
        const COUNT: u64 = 1_000_000;
        const EXPECTED_SUM: u64 = COUNT * (COUNT - 1) / 2;

        let (mut tx, mut rx) = channel::<u64>(1024);

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

    #[test]
    fn cross_thread_ordering() {
        let (mut tx, mut rx) = channel::<u64>(64);

        let producer = thread::spawn(move || {
            for i in 0..100_000 {
                tx.send(i).unwrap();
            }
        });

        let consumer = thread::spawn(move || {
            for i in 0..100_000 {
                assert_eq!(rx.recv().unwrap(), i);
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
