use std::any::Any;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

/// Errors that can occur when running jobs on a [`ThreadPool`][crate::ThreadPool] or via
/// [`temporary_run()`][crate::temporary_run].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A job panicked. Only the first panic observed in a round is reported.
    #[error("job {index} panicked: {message}")]
    JobPanicked {
        /// The index the panicking job was invoked with.
        index: usize,

        /// The panic message, if the payload was a string.
        message: String,
    },

    /// The operating system refused to create a worker thread.
    #[error("failed to spawn worker thread")]
    SpawnFailed(#[from] io::Error),
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn job_panicked(index: usize, payload: &(dyn Any + Send)) -> Self {
        Self::JobPanicked {
            index,
            message: panic_message(payload),
        }
    }
}

/// Drops a caught panic payload without letting a panicking destructor escape.
///
/// The payload type is chosen by the job, so its `Drop` may itself panic. If it does, the second
/// payload is leaked instead of being dropped in turn.
pub(crate) fn discard_panic_payload(payload: Box<dyn Any + Send>) {
    if let Err(nested) = panic::catch_unwind(AssertUnwindSafe(|| drop(payload))) {
        mem::forget(nested);
    }
}

/// Extracts a human-readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
