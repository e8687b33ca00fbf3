//! Pool management and lifecycle.

use std::any::type_name;
use std::fmt;
use std::io;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::metrics::{ROUND_DURATION_MS, ROUND_JOBS};
use crate::{
    JobPanicPolicy, PoolState, Result, RoundBarrier, RoundJob, Shared, SpawnConfig,
    ThreadPoolBuilder, worker_loop,
};

/// A pool of persistent worker threads that executes "parallel for" rounds.
///
/// Each round, started by [`run_jobs()`][Self::run_jobs], covers the indices `0..total`. The
/// workers and the calling thread claim indices one at a time from a shared counter, so uneven
/// per-index costs balance out on their own. The call returns once every index has been executed
/// and every worker is parked again, and all side effects of the jobs are visible to the caller
/// at that point.
///
/// The thread that starts a round always participates in it, so a pool with
/// [`participant_count()`][Self::participant_count] `n` owns `n - 1` worker threads.
///
/// # Exclusive access
///
/// Starting a round, growing the pool and stopping it all require `&mut self`. Only one round can
/// be in flight at a time and the pool cannot change shape underneath it.
///
/// # Lifetime
///
/// Dropping the pool stops it, joining every worker thread.
///
/// # Example
///
/// ```rust
/// use lockstep::{SpinMutex, ThreadPool};
///
/// let mut pool = ThreadPool::new(2).unwrap();
/// pool.extend(2).unwrap();
/// assert_eq!(pool.participant_count(), 4);
///
/// let squares = SpinMutex::new(Vec::new());
///
/// pool.run_jobs(8, |index| squares.lock().push(index * index)).unwrap();
///
/// let mut squares = squares.into_inner();
/// squares.sort_unstable();
/// assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49]);
/// ```
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    spawn_config: SpawnConfig,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("worker_count", &self.workers.len())
            .field("state", &self.state())
            .field("spawn_config", &self.spawn_config)
            .finish_non_exhaustive()
    }
}

impl ThreadPool {
    /// Creates a pool with `participants` round participants, counting the calling thread.
    ///
    /// This spawns `participants - 1` worker threads; with `participants` of 0 or 1 no thread is
    /// spawned and every round executes inline on the caller.
    ///
    /// Use [`ThreadPool::builder()`] for custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnFailed`][crate::Error::SpawnFailed] if a worker thread could not be
    /// created.
    pub fn new(participants: usize) -> Result<Self> {
        Self::builder().participants(participants).build()
    }

    /// Creates a builder for configuring the pool.
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    pub(crate) fn with_config(spawn_config: SpawnConfig, panic_policy: JobPanicPolicy) -> Self {
        Self {
            shared: Arc::new(Shared::new(panic_policy)),
            workers: Vec::new(),
            spawn_config,
        }
    }

    /// Number of persistent worker threads owned by the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of participants in each round: the workers plus the calling thread.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.workers.len().saturating_add(1)
    }

    /// Current lifecycle state of the pool.
    ///
    /// Outside of the pool's own methods this is always [`PoolState::Idle`].
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.state.load()
    }

    /// Spawns `additional` worker threads.
    ///
    /// Returns once all new workers are parked, so the next round immediately uses the enlarged
    /// participant count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnFailed`][crate::Error::SpawnFailed] if a worker thread could not be
    /// created. Workers spawned before the failure remain part of the pool.
    pub fn extend(&mut self, additional: usize) -> Result<()> {
        self.workers.reserve(additional);

        let mut outcome = Ok(());

        for _ in 0..additional {
            // The worker may park before we get around to waiting for it, so it has to be
            // expected before it exists.
            self.shared.handshake.lock().expected_parked += 1;

            match self.spawn_worker(self.workers.len()) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.shared.handshake.lock().expected_parked -= 1;
                    warn!(error = %e, "failed to spawn worker thread");
                    outcome = Err(e.into());
                    break;
                }
            }
        }

        {
            let mut handshake = self.shared.handshake.lock();
            self.shared.wait_all_parked(&mut handshake);
        }

        debug!(worker_count = self.workers.len(), "pool extended");

        outcome
    }

    fn spawn_worker(&self, worker_index: usize) -> io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(format!(
            "{}-{worker_index}",
            self.spawn_config.thread_name_prefix
        ));

        if let Some(stack_size) = self.spawn_config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = Arc::clone(&self.shared);

        builder.spawn(move || {
            debug!(worker_index, "worker thread started");
            worker_loop(&shared, worker_index);
            debug!(worker_index, "worker thread exiting");
        })
    }

    /// Executes `job(index)` for every index in `0..total`, exactly once each.
    ///
    /// All workers and the calling thread take part. The order in which indices execute and the
    /// thread each one executes on are unspecified. Returns once every job has finished and every
    /// worker is parked again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobPanicked`][crate::Error::JobPanicked] with the first panic raised by a
    /// job in this round. Whether the remaining indices still execute depends on the
    /// [`JobPanicPolicy`] the pool was built with. The pool remains usable either way.
    pub fn run_jobs<F>(&mut self, total: usize, job: F) -> Result<()>
    where
        F: Fn(usize) + Sync,
    {
        ROUND_JOBS.with(|e| e.observe(total));

        ROUND_DURATION_MS.with(|e| e.observe_duration_millis(|| self.run_round(total, &job)))
    }

    /// Executes `job(index)` once for every participant index in `0..participant_count()`.
    ///
    /// This is typically used for per-participant setup or teardown rather than for data-parallel
    /// work. Which participant ends up executing which index is still unspecified.
    ///
    /// The index range counts the calling thread, so it is one larger than
    /// [`worker_count()`][Self::worker_count]. Setup code that keeps one slot per worker thread
    /// needs a slot for the caller as well; a pool of size 1 still calls `job(0)` once.
    ///
    /// # Errors
    ///
    /// Same as [`run_jobs()`][Self::run_jobs].
    pub fn run<F>(&mut self, job: F) -> Result<()>
    where
        F: Fn(usize) + Sync,
    {
        self.run_jobs(self.participant_count(), job)
    }

    #[cfg_attr(test, mutants::skip)] // Skipping any part of the barrier deadlocks or races.
    fn run_round(&mut self, total: usize, body: &(dyn Fn(usize) + Sync)) -> Result<()> {
        // SAFETY: Workers only use the descriptor between picking it up and parking again, and we
        // do not return before every worker has parked.
        let job = unsafe { RoundJob::erase(body, total) };

        trace!(total, worker_count = self.workers.len(), "round starting");

        let barrier = if self.workers.is_empty() {
            self.shared.cursor.store(0, Ordering::Relaxed);
            self.shared.state.store(PoolState::Running);

            None
        } else {
            let mut handshake = self.shared.handshake.lock();

            handshake.job = Some(job);
            handshake.generation = handshake.generation.wrapping_add(1);
            self.shared.cursor.store(0, Ordering::Relaxed);
            self.shared.parked.store(0, Ordering::Relaxed);
            self.shared.state.store(PoolState::Running);

            self.shared.round_started.notify_all();

            Some(RoundBarrier::new(&self.shared))
        };

        self.shared.participate(job);

        drop(barrier);

        self.shared.state.store(PoolState::Idle);

        trace!(total = job.total(), "round complete");

        self.shared.take_failure().map_or(Ok(()), Err)
    }

    /// Stops the pool, joining every worker thread.
    ///
    /// Afterwards the pool has no workers and runs rounds inline on the caller until it is
    /// extended again. Stopping a pool that has no workers does nothing.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of a worker thread that died outside of a job, which indicates a bug
    /// in the pool itself. This does not happen if the current thread is already panicking.
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        {
            let _handshake = self.shared.handshake.lock();
            self.shared.state.store(PoolState::Stopping);
            self.shared.round_started.notify_all();
        }

        let mut first_panic = None;

        for handle in self.workers.drain(..) {
            if let Err(payload) = handle.join() {
                first_panic.get_or_insert(payload);
            }
        }

        {
            let mut handshake = self.shared.handshake.lock();
            handshake.expected_parked = 0;
            self.shared.parked.store(0, Ordering::Relaxed);
            self.shared.state.store(PoolState::Idle);
        }

        debug!("pool stopped");

        if let Some(payload) = first_panic {
            // Workers run every job inside a panic trap, so this is a bug in the pool.
            if thread::panicking() {
                warn!("worker thread panicked while the pool was being dropped during a panic");
            } else {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}
