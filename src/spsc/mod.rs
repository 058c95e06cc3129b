//! Single-producer single-consumer (SPSC) bounded queues.
//!
//! Five coordination protocols over the same ring-buffer shape, differing
//! in where the producer and consumer meet in the cache hierarchy:
//!
//! | Module | Coordination | Shared loads per op |
//! |--------|--------------|---------------------|
//! | [`counter`] | shared head/tail counters | one acquire load every attempt |
//! | [`cached`] (default) | counters + cached peer snapshot | only when the cache runs out |
//! | [`slot`] | per-slot ready flag, no counters | one, spread across slot lines |
//! | [`batched`] | counters published in batches | amortized; **stalls when idle** |
//! | [`parking`] | per-slot semaphores, OS park/unpark | sleeps instead of yielding |
//!
//! [`channel`] re-exports the [`cached`] constructor, the right default
//! for almost every workload. [`slot`] often edges it out on hardware
//! where the slot array spreads coherence traffic better than two counter
//! lines; benchmark on your target before switching. [`batched`] exists
//! to demonstrate why publication frequency matters; see its module docs
//! before touching it.
//!
//! All variants enforce the single-producer single-consumer discipline
//! statically: every hot-path operation takes `&mut self`, so exactly one
//! thread at a time can produce and one can consume.
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use lockring::spsc;
//!
//! let (mut tx, mut rx) = spsc::channel::<u64>(1024);
//!
//! let producer = thread::spawn(move || {
//!     for i in 0..100 {
//!         tx.send(i).unwrap();
//!     }
//! });
//!
//! for i in 0..100 {
//!     assert_eq!(rx.recv().unwrap(), i);
//! }
//!
//! producer.join().unwrap();
//! ```

pub mod batched;
pub mod cached;
pub mod counter;
pub mod parking;
pub mod slot;

pub use cached::{Receiver, Sender, channel};
