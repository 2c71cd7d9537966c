//! Single-assignment result cells.
//!
//! A [`Promise`] starts unresolved, holding the continuation routines and
//! wait events registered on it. The first `set_result` / `set_exception`
//! swaps that list for the outcome under one lock, then fires everything it
//! took out. Later attempts report `false` and change nothing.
//!
//! # Example
//!
//! ```rust
//! use cultio::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::with_config(
//!     SchedulerConfig::new().with_max_workers(1).allow_any_home_thread(),
//! ).unwrap();
//!
//! let promise = scheduler.promise::<i32>().unwrap();
//! assert!(promise.set_result(7));
//! assert!(!promise.set_result(8));
//! assert_eq!(promise.result().unwrap(), Some(7));
//! ```

use std::any::type_name;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Failure, RuntimeError};
use crate::event::Event;
use crate::future::Future;
use crate::routine::{Routine, Spawn};
use crate::scheduler::SchedulerHandle;

enum PromiseState<T> {
    Unresolved {
        /// Continuations, spawned in registration order on resolution.
        pending: Vec<Box<dyn Spawn>>,
        /// Wait events of futures derived from this promise.
        watchers: Vec<Arc<Event>>,
    },
    Resolved(Result<T, Failure>),
}

struct PromiseInner<T> {
    scheduler: SchedulerHandle,
    /// Mirrors the state tag so readers can check without locking.
    resolved: AtomicBool,
    state: Mutex<PromiseState<T>>,
}

/// The eventual result or failure of a routine.
///
/// Cloning yields another handle to the same cell.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a promise on a participant thread.
    pub(crate) fn new(scheduler: &SchedulerHandle) -> Result<Self, RuntimeError> {
        scheduler.ensure_participant()?;
        Ok(Self::new_unchecked(scheduler))
    }

    /// Create a promise on behalf of a worker, skipping the thread check.
    pub(crate) fn new_unchecked(scheduler: &SchedulerHandle) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                scheduler: scheduler.clone(),
                resolved: AtomicBool::new(false),
                state: Mutex::new(PromiseState::Unresolved {
                    pending: Vec::new(),
                    watchers: Vec::new(),
                }),
            }),
        }
    }

    pub(crate) fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }

    /// Returns true once a result or failure has been stored.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// The stored outcome, or `Unset` before resolution.
    pub fn outcome(&self) -> Result<Result<T, Failure>, RuntimeError> {
        match &*self.inner.state.lock() {
            PromiseState::Resolved(outcome) => Ok(outcome.clone()),
            PromiseState::Unresolved { .. } => Err(RuntimeError::Unset),
        }
    }

    /// The stored value; `None` if the promise failed.
    pub fn result(&self) -> Result<Option<T>, RuntimeError> {
        Ok(self.outcome()?.ok())
    }

    /// The stored failure; `None` if the promise succeeded.
    pub fn exception(&self) -> Result<Option<Failure>, RuntimeError> {
        Ok(self.outcome()?.err())
    }

    /// The stored value, with a stored failure folded into `Failed`.
    pub fn get(&self) -> Result<T, RuntimeError> {
        self.outcome()?.map_err(RuntimeError::Failed)
    }

    /// Resolve with a value. Returns false if the promise was already set.
    pub fn set_result(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolve with a failure. Returns false if the promise was already set.
    pub fn set_exception(&self, error: impl Into<Failure>) -> bool {
        self.resolve(Err(error.into()))
    }

    fn resolve(&self, outcome: Result<T, Failure>) -> bool {
        let (pending, watchers) = {
            let mut state = self.inner.state.lock();
            let (pending, watchers) = match &mut *state {
                PromiseState::Resolved(_) => return false,
                PromiseState::Unresolved { pending, watchers } => {
                    (mem::take(pending), mem::take(watchers))
                }
            };
            *state = PromiseState::Resolved(outcome);
            self.inner.resolved.store(true, Ordering::Release);
            (pending, watchers)
        };

        for event in watchers {
            event.set();
        }

        for routine in pending {
            if let Err(err) = routine.spawn() {
                warn!(routine = routine.name(), error = %err, "failed to spawn callback routine");
            }
        }

        true
    }

    /// Register a continuation that receives this promise once it resolves.
    ///
    /// On an already resolved promise the routine is spawned right away.
    pub fn callback_routine<U, F>(&self, func: F) -> Result<Routine<U>, RuntimeError>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Promise<T>) -> Result<U, Failure> + Send + 'static,
    {
        self.callback_routine_named(type_name::<F>(), func)
    }

    /// Same as [`Promise::callback_routine`] with an explicit routine name.
    pub fn callback_routine_named<U, F>(
        &self,
        name: impl Into<String>,
        func: F,
    ) -> Result<Routine<U>, RuntimeError>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Promise<T>) -> Result<U, Failure> + Send + 'static,
    {
        let promise = self.clone();
        let routine = self
            .inner
            .scheduler
            .routine_named(name, move || func(promise))?;

        let queued = match &mut *self.inner.state.lock() {
            PromiseState::Unresolved { pending, .. } => {
                pending.push(Box::new(routine.clone()));
                true
            }
            PromiseState::Resolved(_) => false,
        };

        if !queued {
            routine.spawn()?;
        }

        Ok(routine)
    }

    /// Set `event` when this promise resolves; immediately if it already has.
    pub(crate) fn watch(&self, event: &Arc<Event>) {
        let watching = match &mut *self.inner.state.lock() {
            PromiseState::Unresolved { watchers, .. } => {
                watchers.push(Arc::clone(event));
                true
            }
            PromiseState::Resolved(_) => false,
        };

        if !watching {
            event.set();
        }
    }

    /// Stop watching with `event`, after a wait gave up on it.
    pub(crate) fn unwatch(&self, event: &Arc<Event>) {
        if let PromiseState::Unresolved { watchers, .. } = &mut *self.inner.state.lock() {
            watchers.retain(|watcher| !Arc::ptr_eq(watcher, event));
        }
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        match &*self.inner.state.lock() {
            PromiseState::Unresolved { watchers, .. } => watchers.len(),
            PromiseState::Resolved(_) => 0,
        }
    }

    /// A wait handle owned by the calling routine.
    pub fn future(&self) -> Result<Future<T>, RuntimeError> {
        Future::new(self.clone())
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.inner.resolved.load(Ordering::Acquire);
        f.debug_struct("Promise").field("set", &set).finish()
    }
}
