//! The round protocol shared by the initiating thread and the persistent workers.
//!
//! Claiming and executing jobs never takes a lock. The handshake lock is only held to hand a
//! round descriptor to the workers and to count them back in when they park.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::error::discard_panic_payload;
use crate::metrics::JOB_PANICS;
use crate::{AtomicPoolState, Error, JobPanicPolicy, PoolState};

/// The job body and index range of one round.
///
/// The body is borrowed from the initiating thread's stack. The lifetime is erased so that
/// persistent workers can hold on to it, which is sound only because the initiator does not return
/// until every worker has parked again and dropped its copy.
#[derive(Clone, Copy)]
pub(crate) struct RoundJob {
    body: &'static (dyn Fn(usize) + Sync),
    total: usize,
}

impl RoundJob {
    /// # Safety
    ///
    /// The returned descriptor (and every copy of it) must not be used after `body` goes out of
    /// scope.
    pub(crate) unsafe fn erase<'a>(body: &'a (dyn Fn(usize) + Sync + 'a), total: usize) -> Self {
        // SAFETY: Only the lifetime changes; the caller guarantees no use outlives `'a`.
        let body = unsafe {
            mem::transmute::<&'a (dyn Fn(usize) + Sync + 'a), &'static (dyn Fn(usize) + Sync)>(
                body,
            )
        };

        Self { body, total }
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }
}

/// Handshake data, only accessed while holding the handshake lock.
#[derive(Default)]
pub(crate) struct Handshake {
    /// Incremented every time a round starts. Workers compare against the last generation they
    /// drained, so a worker that wakes late still joins its round and never runs one twice.
    pub(crate) generation: u64,

    /// Descriptor of the current round. `None` between rounds.
    pub(crate) job: Option<RoundJob>,

    /// How many parked workers complete the barrier.
    pub(crate) expected_parked: usize,
}

/// State shared between a pool and its workers.
pub(crate) struct Shared {
    pub(crate) state: AtomicPoolState,

    /// Next unclaimed job index of the current round.
    pub(crate) cursor: AtomicUsize,

    /// Workers parked since the current round started. Only modified while holding the handshake
    /// lock, so the barrier check cannot miss a wakeup.
    pub(crate) parked: AtomicUsize,

    pub(crate) handshake: Mutex<Handshake>,

    /// Signaled when a new round starts or the pool is stopping.
    pub(crate) round_started: Condvar,

    /// Signaled by the last worker to park.
    pub(crate) all_parked: Condvar,

    /// First job failure of the current round.
    pub(crate) failure: Mutex<Option<Error>>,

    pub(crate) panic_policy: JobPanicPolicy,
}

impl Shared {
    pub(crate) fn new(panic_policy: JobPanicPolicy) -> Self {
        Self {
            state: AtomicPoolState::new(PoolState::Idle),
            cursor: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            handshake: Mutex::new(Handshake::default()),
            round_started: Condvar::new(),
            all_parked: Condvar::new(),
            failure: Mutex::new(None),
            panic_policy,
        }
    }

    /// Claims and executes jobs until the cursor is exhausted.
    ///
    /// Every participant of a round, the initiator included, runs this loop.
    pub(crate) fn participate(&self, job: RoundJob) {
        // Relaxed is enough: uniqueness comes from the read-modify-write itself and the handshake
        // lock orders the round setup before any participant gets here. The cursor never moves
        // past `total`, so it cannot wrap around and hand out an index a second time.
        while let Ok(index) = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next < job.total).then_some(next.wrapping_add(1))
            })
        {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (job.body)(index))) {
                self.record_failure(Error::job_panicked(index, payload.as_ref()), job.total);
                discard_panic_payload(payload);
            }
        }

        self.state.transition(PoolState::Running, PoolState::Idle);
    }

    fn record_failure(&self, error: Error, total: usize) {
        JOB_PANICS.with(|e| e.observe_once());
        warn!(%error, "captured panic from job");

        {
            let mut failure = self.failure.lock();

            if failure.is_none() {
                *failure = Some(error);
            }
        }

        if self.panic_policy == JobPanicPolicy::Abandon {
            // Pushing the cursor to the end keeps it monotonic, so indices claimed before this
            // point are unaffected and nothing new gets claimed after it.
            self.cursor.fetch_max(total, Ordering::Relaxed);
        }
    }

    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    /// Blocks until every expected worker has parked.
    pub(crate) fn wait_all_parked(&self, handshake: &mut MutexGuard<'_, Handshake>) {
        while self.parked.load(Ordering::Relaxed) < handshake.expected_parked {
            self.all_parked.wait(handshake);
        }
    }
}

/// Waits for every worker to park when dropped, so that a round descriptor borrowed from the
/// initiator's stack is never left in use by a worker after the initiator leaves the round, even
/// if the initiator unwinds.
pub(crate) struct RoundBarrier<'a> {
    shared: &'a Shared,
}

impl<'a> RoundBarrier<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }
}

impl Drop for RoundBarrier<'_> {
    fn drop(&mut self) {
        let mut handshake = self.shared.handshake.lock();
        self.shared.wait_all_parked(&mut handshake);
        handshake.job = None;
    }
}

/// Takes a worker out of the barrier count if it unwinds out of its control loop, so the current
/// and future rounds do not wait for a thread that is gone.
struct RetireOnUnwind<'a> {
    shared: &'a Shared,
    worker_index: usize,
}

impl Drop for RetireOnUnwind<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }

        error!(
            worker_index = self.worker_index,
            "worker thread is unwinding, removing it from the round barrier"
        );

        let mut handshake = self.shared.handshake.lock();
        handshake.expected_parked = handshake.expected_parked.saturating_sub(1);
        self.shared.all_parked.notify_all();
    }
}

/// Control loop of a persistent worker thread.
///
/// A worker starts out parked in the current generation, so it only ever joins rounds that begin
/// after it was spawned.
pub(crate) fn worker_loop(shared: &Shared, worker_index: usize) {
    // Declared before the handshake guard so that the lock is already released when it runs.
    let _retire = RetireOnUnwind {
        shared,
        worker_index,
    };

    let mut handshake = shared.handshake.lock();
    let mut seen_generation = handshake.generation;

    loop {
        let parked = shared.parked.fetch_add(1, Ordering::Relaxed) + 1;

        if parked == handshake.expected_parked {
            shared.all_parked.notify_all();
        }

        while handshake.generation == seen_generation && shared.state.load() != PoolState::Stopping
        {
            shared.round_started.wait(&mut handshake);
        }

        if shared.state.load() == PoolState::Stopping {
            debug!(worker_index, "worker observed stop");
            return;
        }

        seen_generation = handshake.generation;

        let Some(job) = handshake.job else {
            // A generation is only ever published together with its descriptor.
            unreachable!("round generation advanced without a job descriptor");
        };

        MutexGuard::unlocked(&mut handshake, || shared.participate(job));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn count_calls(shared: &Shared, total: usize) -> Vec<usize> {
        let calls = (0..total).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
        let body = |index: usize| {
            calls[index].fetch_add(1, Ordering::Relaxed);
        };

        // SAFETY: The descriptor is only used within this function, while `body` is alive.
        let job = unsafe { RoundJob::erase(&body, total) };
        shared.participate(job);

        calls.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    #[test]
    fn participate_runs_every_index_once() {
        let shared = Shared::new(JobPanicPolicy::Abandon);

        assert_eq!(count_calls(&shared, 5), vec![1, 1, 1, 1, 1]);
        assert!(shared.take_failure().is_none());
    }

    #[test]
    fn participate_with_no_jobs_does_nothing() {
        let shared = Shared::new(JobPanicPolicy::Abandon);

        assert!(count_calls(&shared, 0).is_empty());
    }

    #[test]
    fn participate_flips_running_back_to_idle() {
        let shared = Shared::new(JobPanicPolicy::Abandon);
        shared.state.store(PoolState::Running);

        count_calls(&shared, 3);

        assert_eq!(shared.state.load(), PoolState::Idle);
    }

    #[test]
    fn abandon_policy_stops_claiming_after_panic() {
        let shared = Shared::new(JobPanicPolicy::Abandon);
        let calls = AtomicUsize::new(0);
        let body = |index: usize| {
            calls.fetch_add(1, Ordering::Relaxed);
            assert_ne!(index, 2, "index 2 is broken");
        };

        // SAFETY: The descriptor is only used within this test, while `body` is alive.
        let job = unsafe { RoundJob::erase(&body, 10) };
        shared.participate(job);

        // A single participant claims in order, so 0, 1 and 2 ran and nothing after.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(matches!(
            shared.take_failure(),
            Some(Error::JobPanicked { index: 2, .. })
        ));
    }

    #[test]
    fn cursor_stops_at_end_of_largest_range() {
        let shared = Shared::new(JobPanicPolicy::Abandon);
        shared.cursor.store(usize::MAX - 3, Ordering::Relaxed);

        let seen = Mutex::new(Vec::new());
        let body = |index: usize| seen.lock().push(index);

        // SAFETY: The descriptor is only used within this test, while `body` is alive.
        let job = unsafe { RoundJob::erase(&body, usize::MAX) };

        shared.participate(job);
        // A late participant finds nothing left and does not move the cursor.
        shared.participate(job);

        assert_eq!(
            seen.into_inner(),
            vec![usize::MAX - 3, usize::MAX - 2, usize::MAX - 1]
        );
        assert_eq!(shared.cursor.load(Ordering::Relaxed), usize::MAX);
    }

    #[test]
    fn abandoned_largest_range_never_reclaims_indices() {
        let shared = Shared::new(JobPanicPolicy::Abandon);
        let calls = AtomicUsize::new(0);
        let body = |index: usize| {
            calls.fetch_add(1, Ordering::Relaxed);
            assert_ne!(index, 0, "first job fails");
        };

        // SAFETY: The descriptor is only used within this test, while `body` is alive.
        let job = unsafe { RoundJob::erase(&body, usize::MAX) };

        for _ in 0..4 {
            shared.participate(job);
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(shared.cursor.load(Ordering::Relaxed), usize::MAX);
        assert!(matches!(
            shared.take_failure(),
            Some(Error::JobPanicked { index: 0, .. })
        ));
    }

    struct PanicsOnDrop;

    impl Drop for PanicsOnDrop {
        fn drop(&mut self) {
            panic!("payload destructor fails");
        }
    }

    #[test]
    fn payload_with_panicking_destructor_is_contained() {
        let shared = Shared::new(JobPanicPolicy::Drain);
        shared.state.store(PoolState::Running);
        let calls = AtomicUsize::new(0);
        let body = |index: usize| {
            calls.fetch_add(1, Ordering::Relaxed);

            if index == 1 {
                panic::panic_any(PanicsOnDrop);
            }
        };

        // SAFETY: The descriptor is only used within this test, while `body` is alive.
        let job = unsafe { RoundJob::erase(&body, 4) };
        shared.participate(job);

        assert_eq!(calls.load(Ordering::Relaxed), 4);
        assert_eq!(shared.state.load(), PoolState::Idle);
        assert!(matches!(
            shared.take_failure(),
            Some(Error::JobPanicked { index: 1, .. })
        ));
    }

    #[test]
    fn drain_policy_keeps_claiming_after_panic() {
        let shared = Shared::new(JobPanicPolicy::Drain);
        let calls = AtomicUsize::new(0);
        let body = |index: usize| {
            calls.fetch_add(1, Ordering::Relaxed);
            assert!(index % 3 != 1, "every third index is broken");
        };

        // SAFETY: The descriptor is only used within this test, while `body` is alive.
        let job = unsafe { RoundJob::erase(&body, 10) };
        shared.participate(job);

        assert_eq!(calls.load(Ordering::Relaxed), 10);

        // Only the first failure is kept.
        assert!(matches!(
            shared.take_failure(),
            Some(Error::JobPanicked { index: 1, .. })
        ));
        assert!(shared.take_failure().is_none());
    }
}
