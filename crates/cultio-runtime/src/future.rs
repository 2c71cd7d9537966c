//! Owned wait handles over promises.
//!
//! A [`Future`] belongs to the routine that was running when it was created,
//! and only that routine may block on it. While blocked, the routine points
//! at the future's event so the interrupt router can wake it in place
//! instead of injecting a failure into a thread stuck in a blocking wait.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::{Failure, RuntimeError};
use crate::event::{Event, WaitOutcome};
use crate::promise::Promise;
use crate::routine::{Routine, RoutineHandle};

/// A single-consumer wait handle derived from a [`Promise`].
pub struct Future<T> {
    promise: Promise<T>,
    owner: RoutineHandle,
    /// Created on the first wait that actually has to block.
    event: OnceLock<Arc<Event>>,
}

impl<T> Future<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(promise: Promise<T>) -> Result<Self, RuntimeError> {
        let owner = promise.scheduler().current_routine()?;
        Ok(Self {
            promise,
            owner,
            event: OnceLock::new(),
        })
    }

    /// The routine allowed to wait on this future.
    pub fn owner(&self) -> &RoutineHandle {
        &self.owner
    }

    pub fn is_set(&self) -> bool {
        self.promise.is_set()
    }

    /// Returns true if an interrupt was delivered to a wait on this future.
    pub fn is_interrupted(&self) -> bool {
        self.event
            .get()
            .is_some_and(|event| event.interrupted().is_some())
    }

    pub fn result(&self) -> Result<Option<T>, RuntimeError> {
        self.promise.result()
    }

    pub fn exception(&self) -> Result<Option<Failure>, RuntimeError> {
        self.promise.exception()
    }

    fn event(&self) -> &Arc<Event> {
        self.event.get_or_init(|| Arc::new(Event::new()))
    }

    /// Block the owning routine until the promise resolves.
    ///
    /// Returns the promise's value, or `Failed` with its failure. Fails with
    /// `Timeout` if `timeout` elapses first and with `Interrupted` if an
    /// interrupt reaches the routine while it is parked here. Calling this
    /// from any routine other than the owner is an error.
    ///
    /// An interrupted future stays interrupted: later waits that have to
    /// block report the same signal.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, RuntimeError> {
        let routine = self.promise.scheduler().current_routine()?;
        if routine.id() != self.owner.id() {
            return Err(RuntimeError::NotOwner {
                waiter: routine.name().to_string(),
                owner: self.owner.name().to_string(),
            });
        }

        if !self.promise.is_set() {
            let event = Arc::clone(self.event());
            let outcome = {
                let _link = routine.park(&event)?;
                self.promise.watch(&event);
                let outcome = event.wait(timeout);
                if outcome != WaitOutcome::Signaled {
                    self.promise.unwatch(&event);
                }
                outcome
            };

            match outcome {
                WaitOutcome::Interrupted(signal) => return Err(RuntimeError::Interrupted(signal)),
                WaitOutcome::TimedOut => {
                    return Err(RuntimeError::Timeout(timeout.unwrap_or_default()))
                }
                WaitOutcome::Signaled => {}
            }
        }

        self.promise.get()
    }

    /// Register a continuation on the underlying promise.
    pub fn callback_routine<U, F>(&self, func: F) -> Result<Routine<U>, RuntimeError>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Promise<T>) -> Result<U, Failure> + Send + 'static,
    {
        self.promise.callback_routine(func)
    }

    /// Register a named continuation on the underlying promise.
    pub fn callback_routine_named<U, F>(
        &self,
        name: impl Into<String>,
        func: F,
    ) -> Result<Routine<U>, RuntimeError>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Promise<T>) -> Result<U, Failure> + Send + 'static,
    {
        self.promise.callback_routine_named(name, func)
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("promise", &self.promise)
            .field("owner", &self.owner.name())
            .finish()
    }
}
