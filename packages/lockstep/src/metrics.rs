//! Metrics for the round pool.
//!
//! The events are thread-local, so observing them from the initiating thread or from a worker
//! does not contend with other participants.

use nm::{Event, Magnitude};

/// Histogram buckets for the number of jobs in one round.
const ROUND_JOBS_BUCKETS: &[Magnitude] = &[0, 1, 4, 16, 64, 256, 1024, 4096, 16384, 65536];

/// Histogram buckets for the wall-clock duration of one round, as seen by the initiator.
const ROUND_DURATION_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 500, 1000, 5000];

thread_local! {
    /// Event for observing the size of each round.
    ///
    /// The magnitude is the number of jobs in the round.
    pub(crate) static ROUND_JOBS: Event = Event::builder()
        .name("lockstep_round_jobs")
        .histogram(ROUND_JOBS_BUCKETS)
        .build();

    /// Event for observing how long each round takes, barrier included.
    ///
    /// The magnitude is the duration in milliseconds.
    pub(crate) static ROUND_DURATION_MS: Event = Event::builder()
        .name("lockstep_round_duration_ms")
        .histogram(ROUND_DURATION_MS_BUCKETS)
        .build();

    /// Event for observing jobs that panicked.
    pub(crate) static JOB_PANICS: Event = Event::builder()
        .name("lockstep_job_panics")
        .build();
}
