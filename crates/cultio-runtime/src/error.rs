//! Error types for the cultio runtime.
//!
//! Two layers live here:
//! - [`RuntimeError`] - conditions raised by the runtime itself (capability
//!   and state violations, timeouts, delivered interrupts)
//! - [`Failure`] - the type-erased error a routine finishes with, stored in
//!   its promise and re-raised by `Future::wait`

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::signal::{Signal, SIGINT};

/// Errors that can occur during runtime operations.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The calling thread is neither the home thread nor a live worker.
    #[error("thread is not a participant of this scheduler")]
    NotParticipant,

    /// A scheduler that requires the main thread was built elsewhere.
    #[error("scheduler can only be created on the main thread")]
    NotMainThread,

    /// A future was waited on by a routine that does not own it.
    #[error("routine {waiter} cannot wait on a future owned by {owner}")]
    NotOwner { waiter: String, owner: String },

    /// `spawn()` was called on a routine that was already spawned.
    #[error("routine already spawned")]
    AlreadySpawned,

    /// A routine tried to park on a second future while already parked.
    #[error("routine is already waiting on a future")]
    AlreadyWaiting,

    /// A worker was handed a routine while still running another one.
    #[error("worker {worker} attempted to run multiple routines (still running {running})")]
    WorkerBusy { worker: String, running: String },

    /// The calling worker thread is not running a routine.
    #[error("thread has no routine")]
    NoRoutine,

    /// A promise was read before it was resolved.
    #[error("cannot read an unset promise")]
    Unset,

    /// An interrupt was raised on a routine that was never spawned.
    #[error("interrupts can only be raised on spawned routines")]
    NotSpawned,

    /// An interrupt was raised on a routine that already finished.
    #[error("interrupts cannot be raised on finished routines")]
    Finished,

    /// `wait()` ran out of time before the promise resolved.
    #[error("timed out after {0:?} while waiting for result")]
    Timeout(Duration),

    /// An interrupt was delivered to the waiting or running routine.
    #[error("{}", interrupt_message(.0))]
    Interrupted(Signal),

    /// A signal number that the host platform does not know about.
    #[error("invalid interrupt: {0}")]
    InvalidSignal(i32),

    /// The awaited routine finished with a failure.
    #[error("{0}")]
    Failed(Failure),

    /// A routine body panicked.
    #[error("routine panicked: {0}")]
    Panicked(String),

    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    Shutdown,

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
}

fn interrupt_message(signal: &Signal) -> String {
    if *signal == SIGINT {
        "keyboard interrupt".to_string()
    } else {
        format!("an interrupt was raised: {}", signal)
    }
}

impl RuntimeError {
    /// The signal carried by an `Interrupted` error, if any.
    pub fn interrupt(&self) -> Option<Signal> {
        match self {
            RuntimeError::Interrupted(signal) => Some(*signal),
            _ => None,
        }
    }

    /// The routine failure carried by a `Failed` error, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            RuntimeError::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A failure produced by a routine.
///
/// Wraps any `std::error::Error` behind a shared pointer, so the same
/// instance can be handed to every waiter. Cloning is cheap and keeps
/// identity, which [`Failure::ptr_eq`] can observe.
///
/// Converting a `RuntimeError::Failed` back into a `Failure` unwraps it, so
/// `?` inside a routine body forwards an upstream failure untouched.
#[derive(Clone)]
pub struct Failure(Arc<dyn StdError + Send + Sync + 'static>);

impl Failure {
    /// Wrap an error value.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = Box::new(error);
        match boxed.downcast::<RuntimeError>() {
            Ok(runtime) => match *runtime {
                RuntimeError::Failed(failure) => failure,
                other => Failure(Arc::new(other)),
            },
            Err(boxed) => Failure(Arc::from(boxed)),
        }
    }

    /// A failure that only carries a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Failure(Arc::new(Message(message.into())))
    }

    /// Borrow the underlying error.
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }

    /// Returns true if the underlying error is an `E`.
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.0.is::<E>()
    }

    /// Downcast to the concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns true if both values share the same error instance.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Failure::new(error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.0).finish()
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SIGTERM;

    #[derive(Debug, Error, PartialEq)]
    #[error("disk full on {0}")]
    struct DiskFull(&'static str);

    #[test]
    fn test_error_display() {
        let err = RuntimeError::AlreadySpawned;
        assert_eq!(err.to_string(), "routine already spawned");

        let err = RuntimeError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "timed out after 250ms while waiting for result");
    }

    #[test]
    fn test_interrupt_display() {
        assert_eq!(RuntimeError::Interrupted(SIGINT).to_string(), "keyboard interrupt");
        assert_eq!(
            RuntimeError::Interrupted(SIGTERM).to_string(),
            "an interrupt was raised: SIGTERM"
        );
        assert_eq!(RuntimeError::Interrupted(SIGTERM).interrupt(), Some(SIGTERM));
    }

    #[test]
    fn test_failure_keeps_identity() {
        let failure = Failure::new(DiskFull("/var"));
        let copy = failure.clone();

        assert!(failure.ptr_eq(&copy));
        assert!(failure.is::<DiskFull>());
        assert_eq!(failure.downcast_ref::<DiskFull>(), Some(&DiskFull("/var")));
        assert_eq!(failure.to_string(), "disk full on /var");
    }

    #[test]
    fn test_failed_unwraps_on_conversion() {
        let failure = Failure::new(DiskFull("/tmp"));
        let forwarded: Failure = RuntimeError::Failed(failure.clone()).into();

        assert!(forwarded.ptr_eq(&failure));
    }

    #[test]
    fn test_runtime_error_becomes_failure() {
        let failure: Failure = RuntimeError::Interrupted(SIGTERM).into();
        let inner = failure.downcast_ref::<RuntimeError>().unwrap();
        assert_eq!(inner.interrupt(), Some(SIGTERM));
    }

    #[test]
    fn test_failure_msg() {
        let failure = Failure::msg("boom");
        assert_eq!(failure.to_string(), "boom");
        assert!(!failure.is::<DiskFull>());
    }
}
