#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, examples and benchmarks in the lockstep workspace.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Runs a test with a timeout, so a deadlocked barrier fails the test instead of hanging it.
///
/// The timeout is 10 seconds normally and 60 seconds under Miri, where thread synchronization
/// is dramatically slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly, so mutation testing can detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode). Panics raised by
/// the test itself are propagated unchanged.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        let result = test_fn();
        // If the receiver is gone, the watchdog already gave up on us.
        drop(tx.send(result));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread.join().expect("test thread sent its result, so it cannot have panicked");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded {timeout:?} timeout, probably deadlocked");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without sending its result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Counts how many times each index in `0..len` has been visited.
///
/// Rounds are supposed to execute every index exactly once; this records visits from any number
/// of threads and checks the outcome afterwards.
///
/// # Example
///
/// ```rust
/// use testing::IndexTally;
///
/// let tally = IndexTally::new(3);
///
/// for index in 0..3 {
///     tally.record(index);
/// }
///
/// tally.assert_each_exactly_once();
/// ```
#[derive(Debug)]
pub struct IndexTally {
    visits: Box<[AtomicUsize]>,
}

impl IndexTally {
    /// Creates a tally for the indices `0..len`, all unvisited.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            visits: (0..len).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Records one visit of `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the tallied range.
    pub fn record(&self, index: usize) {
        let Some(visits) = self.visits.get(index) else {
            panic!(
                "index {index} is outside the tallied range 0..{}",
                self.visits.len()
            );
        };

        visits.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the visit count of every index, in index order.
    #[must_use]
    pub fn counts(&self) -> Vec<usize> {
        self.visits
            .iter()
            .map(|visits| visits.load(Ordering::Relaxed))
            .collect()
    }

    /// Returns the total number of recorded visits.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts().iter().sum()
    }

    /// Asserts that every index was visited exactly once.
    ///
    /// # Panics
    ///
    /// Panics naming the offending indices if any index was skipped or visited repeatedly.
    pub fn assert_each_exactly_once(&self) {
        let wrong = self
            .counts()
            .into_iter()
            .enumerate()
            .filter(|&(_, count)| count != 1)
            .collect::<Vec<_>>();

        assert!(
            wrong.is_empty(),
            "expected every index to be visited once, (index, visits) violating that: {wrong:?}"
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[test]
    #[should_panic(expected = "the test failed")]
    fn watchdog_propagates_test_panic() {
        with_watchdog::<_, ()>(|| panic!("the test failed"));
    }

    #[test]
    fn tally_counts_visits() {
        let tally = IndexTally::new(3);

        tally.record(0);
        tally.record(2);
        tally.record(2);

        assert_eq!(tally.counts(), vec![1, 0, 2]);
        assert_eq!(tally.total(), 3);
    }

    #[test]
    #[should_panic(expected = "expected every index to be visited once")]
    fn tally_detects_missing_index() {
        let tally = IndexTally::new(2);
        tally.record(0);

        tally.assert_each_exactly_once();
    }

    #[test]
    #[should_panic(expected = "index 2 is outside the tallied range 0..2")]
    fn tally_rejects_out_of_range_index() {
        let tally = IndexTally::new(2);
        tally.record(2);
    }

    #[test]
    fn empty_tally_is_trivially_complete() {
        IndexTally::new(0).assert_each_exactly_once();
    }
}
