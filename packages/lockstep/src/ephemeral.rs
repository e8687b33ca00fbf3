//! One-shot fan-out without a persistent pool.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::discard_panic_payload;
use crate::{Error, Result};

/// Runs `job(index)` for every index in `0..threads`, each on its own freshly spawned thread.
///
/// Thread `t` always executes index `t`; there is no dynamic claiming, so one slow index holds up
/// the whole call. Use a [`ThreadPool`][crate::ThreadPool] when the same fan-out repeats or the
/// per-index cost is uneven.
///
/// If `threads` is 0 or 1, `job(0)` is called synchronously on the calling thread and no thread
/// is spawned. Otherwise the call returns after every spawned thread has been joined.
///
/// # Errors
///
/// Returns [`Error::JobPanicked`] with the first panic raised by a job; the other jobs still run to
/// completion. Returns [`Error::SpawnFailed`] if a thread could not be created, in which case the
/// indices from the failed one onward are not executed.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let visited = AtomicUsize::new(0);
///
/// lockstep::temporary_run(4, |index| {
///     visited.fetch_or(1 << index, Ordering::Relaxed);
/// })
/// .unwrap();
///
/// assert_eq!(visited.load(Ordering::Relaxed), 0b1111);
/// ```
pub fn temporary_run<F>(threads: usize, job: F) -> Result<()>
where
    F: Fn(usize) + Sync,
{
    if threads <= 1 {
        return panic::catch_unwind(AssertUnwindSafe(|| job(0))).map_err(|payload| {
            let error = Error::job_panicked(0, payload.as_ref());
            discard_panic_payload(payload);
            error
        });
    }

    trace!(threads, "temporary fan-out starting");

    let job = &job;
    let first_failure = Mutex::new(None);
    let first_failure = &first_failure;

    let spawn_outcome = thread::scope(|scope| {
        for index in 0..threads {
            thread::Builder::new()
                .name(format!("lockstep-temporary-{index}"))
                .spawn_scoped(scope, move || {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(index))) {
                        let error = Error::job_panicked(index, payload.as_ref());
                        discard_panic_payload(payload);
                        warn!(%error, "captured panic from temporary job");

                        first_failure.lock().get_or_insert(error);
                    }
                })?;
        }

        Ok::<_, Error>(())
    });

    spawn_outcome?;

    first_failure.lock().take().map_or(Ok(()), Err)
}
