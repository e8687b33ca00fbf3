use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a [`ThreadPool`][crate::ThreadPool].
///
/// The state is shared by all workers of a pool. It is exposed for diagnostics only; the round
/// protocol guarantees that callers never observe a pool in the middle of a round because every
/// control operation borrows the pool exclusively.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum PoolState {
    /// Workers are parked, waiting for the next round.
    Idle,

    /// A round has been started and its jobs are being claimed.
    Running,

    /// Workers have been told to exit.
    Stopping,
}

impl PoolState {
    const fn to_raw(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Stopping => 2,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => panic!("invalid raw pool state"),
        }
    }
}

/// A [`PoolState`] that can be shared between threads.
#[derive(Debug)]
pub(crate) struct AtomicPoolState {
    raw: AtomicU8,
}

impl AtomicPoolState {
    pub(crate) const fn new(state: PoolState) -> Self {
        Self {
            raw: AtomicU8::new(state.to_raw()),
        }
    }

    pub(crate) fn load(&self) -> PoolState {
        PoolState::from_raw(self.raw.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: PoolState) {
        self.raw.store(state.to_raw(), Ordering::Release);
    }

    /// Moves the state from `current` to `new` if it still is `current`.
    ///
    /// Several participants may race to flip the same transition; all but the first are no-ops.
    pub(crate) fn transition(&self, current: PoolState, new: PoolState) {
        // Losing the race means someone already made (or superseded) the same transition.
        _ = self.raw.compare_exchange(
            current.to_raw(),
            new.to_raw(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}
