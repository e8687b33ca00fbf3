use many_cpus::ProcessorSet;

use crate::{Result, ThreadPool};

const DEFAULT_THREAD_NAME_PREFIX: &str = "lockstep-worker";

/// What happens to the rest of a round after one of its jobs panics.
///
/// Either way, the round still completes its barrier and the first panic is reported by
/// [`ThreadPool::run_jobs()`] as [`Error::JobPanicked`][crate::Error::JobPanicked].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum JobPanicPolicy {
    /// No new indices are claimed once a participant observes the panic. Jobs that were already
    /// claimed by other participants still run to completion.
    #[default]
    Abandon,

    /// Every remaining index is still executed.
    Drain,
}

/// Settings used when spawning worker threads.
#[derive(Clone, Debug)]
pub(crate) struct SpawnConfig {
    pub(crate) thread_name_prefix: String,
    pub(crate) stack_size: Option<usize>,
}

/// Builder for configuring a [`ThreadPool`].
///
/// # Example
///
/// ```rust
/// use lockstep::{JobPanicPolicy, ThreadPool};
///
/// let pool = ThreadPool::builder()
///     .participants(3)
///     .thread_name_prefix("resize")
///     .on_job_panic(JobPanicPolicy::Drain)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.worker_count(), 2);
/// ```
#[derive(Debug)]
#[must_use]
pub struct ThreadPoolBuilder {
    participants: Option<usize>,
    spawn_config: SpawnConfig,
    panic_policy: JobPanicPolicy,
}

impl ThreadPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            participants: None,
            spawn_config: SpawnConfig {
                thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
                stack_size: None,
            },
            panic_policy: JobPanicPolicy::default(),
        }
    }

    /// Sets the number of round participants, counting the thread that starts each round.
    ///
    /// The pool spawns one worker thread less than this. Zero is treated like one: the caller
    /// still executes every round on its own.
    ///
    /// Default is the number of processors available to the current process.
    pub fn participants(mut self, count: usize) -> Self {
        self.participants = Some(count);
        self
    }

    /// Sets the prefix of worker thread names. Workers are named `<prefix>-<index>`.
    ///
    /// Default is `lockstep-worker`.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.spawn_config.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the stack size of worker threads, in bytes.
    ///
    /// Default is the platform default for spawned threads.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.spawn_config.stack_size = Some(bytes);
        self
    }

    /// Sets what happens to the rest of a round after a job panics.
    ///
    /// Default is [`JobPanicPolicy::Abandon`].
    pub fn on_job_panic(mut self, policy: JobPanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    /// Builds the pool and spawns its workers.
    ///
    /// Returns once every worker is parked and ready for the first round.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnFailed`][crate::Error::SpawnFailed] if a worker thread could not be
    /// created. Workers spawned before the failure are stopped again.
    pub fn build(self) -> Result<ThreadPool> {
        let participants = self
            .participants
            .unwrap_or_else(|| ProcessorSet::default().len());

        let mut pool = ThreadPool::with_config(self.spawn_config, self.panic_policy);
        pool.extend(participants.saturating_sub(1))?;

        Ok(pool)
    }
}
