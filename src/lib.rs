//! Bounded lock-free ring-buffer queues for latency-critical applications.
//!
//! `lockring` provides a family of bounded FIFO queues that coordinate
//! producers and consumers through shared counters and per-slot metadata,
//! without mutual-exclusion locks. Every variant exposes the same surface of
//! blocking [`send`](spsc::cached::Sender::send) / [`recv`](spsc::cached::Receiver::recv),
//! non-blocking `try_send`, timed `recv_timeout`, and an idempotent
//! [`close`](spsc::cached::Sender::close), but implements the hot path with
//! a different protocol:
//!
//! - [`mpmc`]: multi-producer / multi-consumer, per-slot sequence numbers
//!   (Vyukov's bounded queue)
//! - [`spsc::counter`]: single-producer / single-consumer, plain shared
//!   head/tail counters
//! - [`spsc::cached`] (default SPSC): cached peer counters, amortizing
//!   cross-core loads
//! - [`spsc::slot`]: per-slot ready flags, no shared counters at all
//! - [`spsc::batched`]: deferred counter publication, which **stalls under
//!   low traffic by design**; kept as a baseline; use [`spsc::cached`] instead
//! - [`spsc::parking`]: per-slot semaphores with OS park/unpark, the only
//!   variant that sleeps instead of yielding
//!
//! # Quick Start
//!
//! ```
//! use lockring::spsc;
//!
//! let (mut tx, mut rx) = spsc::channel::<u64>(1024);
//!
//! tx.send(42).unwrap();
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```
//!
//! # Blocking model
//!
//! Blocking operations busy-wait, yielding to the scheduler between
//! attempts. There is no OS-level parking outside [`spsc::parking`], so
//! wakeup latency after [`close`](spsc::cached::Sender::close) is bounded
//! by one scheduling quantum rather than a syscall round-trip.
//!
//! # Closing
//!
//! Closing is explicit and one-way: once either endpoint calls `close`, all
//! subsequent (and in-flight blocked) operations fail with
//! [`SendError`] / [`RecvError`]. Closing never frees the buffer; memory is
//! reclaimed when the last endpoint is dropped, along with any payloads
//! still queued.
//!
//! # Capacity
//!
//! Capacities round up to the next power of two so slot indexing reduces to
//! a mask. [`mpmc`] additionally enforces a minimum of 2: its sequence
//! arithmetic uses `index + 1` as the "readable" tag, which a one-slot ring
//! cannot represent.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod mpmc;
pub mod spsc;

/// One-way close flag shared by both endpoints of a queue.
///
/// `close` publishes with release semantics and is idempotent; retry loops
/// read the flag relaxed (the flag only gates control flow, the payload
/// hand-off carries its own release/acquire pair).
pub(crate) struct CloseFlag(AtomicBool);

impl CloseFlag {
    pub(crate) const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Marks the queue closed. Returns `true` if this call did the closing.
    pub(crate) fn close(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Acquire read, for observers that need to see writes made before close.
    #[inline]
    pub(crate) fn is_closed_sync(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Error returned by blocking `send` when the queue has been closed.
///
/// Contains the value that could not be sent, returning ownership to the
/// caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Returns the value that could not be sent.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sending on a closed queue")
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Error returned by non-blocking `try_send`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The queue was full. Contains the value that couldn't be sent.
    ///
    /// For single-producer variants this is a firm statement about queue
    /// state; for [`mpmc`] it may be spurious under producer contention
    /// (see [`mpmc::Sender::try_send`]).
    Full(T),
    /// The queue has been closed. Contains the value that couldn't be sent.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the value that couldn't be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(val) | Self::Closed(val) => val,
        }
    }

    /// Returns `true` if this error is the `Full` variant.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Returns `true` if this error is the `Closed` variant.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "queue is full"),
            Self::Closed(_) => write!(f, "sending on a closed queue"),
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Error returned by blocking `recv` when the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receiving on a closed queue")
    }
}

impl std::error::Error for RecvError {}

/// Error returned by `recv_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// The deadline elapsed before an item became available.
    Timeout,
    /// The queue has been closed.
    Closed,
}

impl RecvTimeoutError {
    /// Returns `true` if this error is the `Timeout` variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns `true` if this error is the `Closed` variant.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "receive timed out"),
            Self::Closed => write!(f, "receiving on a closed queue"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use crossbeam_utils::CachePadded;

    use super::*;

    #[test]
    fn close_flag_is_idempotent() {
        let flag = CloseFlag::new();
        assert!(!flag.is_closed());

        assert!(flag.close());
        assert!(flag.is_closed());

        // Second close is a no-op
        assert!(!flag.close());
        assert!(flag.is_closed());
    }

    #[test]
    fn padded_counter_owns_a_cache_line() {
        // Shared counters are wrapped in CachePadded; this pins the layout
        // guarantee the hot paths rely on.
        assert!(std::mem::align_of::<CachePadded<AtomicUsize>>() >= 64);
        assert!(std::mem::size_of::<CachePadded<AtomicUsize>>() >= 64);
    }

    #[test]
    fn error_displays() {
        assert_eq!(SendError(1u32).to_string(), "sending on a closed queue");
        assert_eq!(TrySendError::Full(1u32).to_string(), "queue is full");
        assert_eq!(RecvError.to_string(), "receiving on a closed queue");
        assert_eq!(RecvTimeoutError::Timeout.to_string(), "receive timed out");
    }

    #[test]
    fn try_send_error_returns_value() {
        let err = TrySendError::Full("payload");
        assert!(err.is_full());
        assert_eq!(err.into_inner(), "payload");

        let err = TrySendError::Closed("payload");
        assert!(err.is_closed());
        assert_eq!(err.into_inner(), "payload");
    }
}
