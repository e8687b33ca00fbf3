#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Persistent worker pool that executes barrier-synchronized "parallel for" rounds.
//!
//! A [`ThreadPool`] owns a set of parked worker threads. Each round hands the pool a job count
//! `N` and a callable taking an index; the workers and the calling thread cooperatively claim
//! indices `0..N` from a shared atomic cursor and the call returns once every index has been
//! executed and every worker is parked again.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use lockstep::ThreadPool;
//!
//! let mut pool = ThreadPool::new(4).unwrap();
//! let sum = AtomicUsize::new(0);
//!
//! pool.run_jobs(100, |index| {
//!     sum.fetch_add(index, Ordering::Relaxed);
//! })
//! .unwrap();
//!
//! assert_eq!(sum.load(Ordering::Relaxed), 4950);
//! ```
//!
//! # Participants
//!
//! The thread that starts a round always takes part in it, so a pool created with
//! `ThreadPool::new(n)` spawns `n - 1` worker threads. A pool of size 1 never spawns a thread and
//! runs every round inline.
//!
//! # One-shot fan-out
//!
//! When standing up a pool is not worthwhile, [`temporary_run()`] spawns one thread per index,
//! runs them and joins them before returning.
//!
//! # Panics
//!
//! A panic inside a job does not tear down the pool. The first panic of a round is captured
//! together with the index that raised it and returned from [`ThreadPool::run_jobs()`] as
//! [`Error::JobPanicked`] once the round has fully settled. See [`JobPanicPolicy`] for what
//! happens to the remaining indices.
//!
//! # Spin lock
//!
//! [`SpinLock`] is a busy-wait lock for very short critical sections, for example guarding shared
//! state mutated by jobs. It implements [`lock_api::RawMutex`][parking_lot::lock_api::RawMutex],
//! so [`SpinMutex`] can be swapped for a blocking mutex without touching call sites.

mod builder;
mod ephemeral;
mod error;
mod metrics;
mod pool;
mod round;
mod spin_lock;
mod state;

pub use builder::*;
pub use ephemeral::*;
pub use error::*;
pub use pool::*;
pub(crate) use round::*;
pub use spin_lock::*;
pub use state::*;
