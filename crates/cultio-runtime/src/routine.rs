//! Routines: named, schedulable units of work.
//!
//! This module provides:
//! - `Routine<T>` - a callable bound to a scheduler, owning the promise of its result
//! - `RoutineHandle` - the type-erased view workers, futures and the
//!   interrupt router share
//! - `RoutineId` / `RoutineState` - identity and lifecycle
//!
//! # Lifecycle
//!
//! ```text
//! Unspawned --spawn()--> Spawned --worker picks it up--> Running --body returns--> Completed
//! ```
//!
//! A routine is spawned at most once. While running it may park on one
//! future at a time; the parking link and any pending injected interrupt
//! live under the same lock so interrupt delivery cannot race wait start
//! and stop.

use std::any::{type_name, Any};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Failure, RuntimeError};
use crate::event::Event;
use crate::future::Future;
use crate::interrupt::{InterruptPolicy, InterruptTable};
use crate::promise::Promise;
use crate::scheduler::SchedulerHandle;
use crate::signal::Signal;
use crate::worker::Runnable;

/// Unique identifier for a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutineId(u64);

impl RoutineId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RoutineId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RoutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Routine({})", self.0)
    }
}

/// Lifecycle of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineState {
    /// Created, not yet handed to a worker.
    Unspawned,
    /// Queued on a worker.
    Spawned,
    /// Executing on a worker.
    Running,
    /// Body returned and the promise is resolved.
    Completed,
}

/// How a raised interrupt reached its routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Woke the routine inside its parked `wait()`.
    Parked,
    /// Left pending for the routine's next safe point.
    Injected,
}

#[derive(Default)]
struct Parking {
    /// Event of the future the routine is blocked on.
    waiting: Option<Arc<Event>>,
    /// Interrupt waiting for the next safe point.
    injected: Option<Signal>,
}

struct RoutineCore {
    id: RoutineId,
    name: String,
    interrupts: Mutex<InterruptTable>,
    state: Mutex<RoutineState>,
    state_changed: Condvar,
    parking: Mutex<Parking>,
    enqueued: Mutex<Vec<Signal>>,
}

/// Shared, type-erased view of a routine.
#[derive(Clone)]
pub struct RoutineHandle {
    core: Arc<RoutineCore>,
}

impl RoutineHandle {
    fn with_state(name: String, state: RoutineState) -> Self {
        Self {
            core: Arc::new(RoutineCore {
                id: RoutineId::new(),
                name,
                interrupts: Mutex::new(InterruptTable::new()),
                state: Mutex::new(state),
                state_changed: Condvar::new(),
                parking: Mutex::new(Parking::default()),
                enqueued: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The routine standing for a home thread; it runs for as long as the
    /// scheduler does.
    pub(crate) fn root(name: impl Into<String>) -> Self {
        Self::with_state(name.into(), RoutineState::Running)
    }

    pub fn id(&self) -> RoutineId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> RoutineState {
        *self.core.state.lock()
    }

    pub fn is_spawned(&self) -> bool {
        self.state() != RoutineState::Unspawned
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RoutineState::Completed
    }

    /// Returns true while the routine is blocked in `Future::wait`.
    pub fn is_parked(&self) -> bool {
        self.core.parking.lock().waiting.is_some()
    }

    /// The policy for `signal`; `Raise` unless set otherwise.
    pub fn get_interrupt(&self, signal: Signal) -> InterruptPolicy {
        self.core.interrupts.lock().get(signal)
    }

    /// Install a policy for `signal`, returning the previous one.
    pub fn set_interrupt(&self, signal: Signal, policy: InterruptPolicy) -> Option<InterruptPolicy> {
        self.core.interrupts.lock().set(signal, policy)
    }

    pub fn is_ignored(&self, signal: Signal) -> bool {
        self.core.interrupts.lock().is_ignored(signal)
    }

    pub fn is_enqueued(&self, signal: Signal) -> bool {
        self.core.interrupts.lock().is_enqueued(signal)
    }

    /// Interrupts recorded under the `Enqueue` policy, oldest first.
    pub fn enqueued_interrupts(&self) -> Vec<Signal> {
        self.core.enqueued.lock().clone()
    }

    /// Drain the recorded interrupts.
    pub fn take_enqueued_interrupts(&self) -> Vec<Signal> {
        std::mem::take(&mut *self.core.enqueued.lock())
    }

    /// Safe point: surface an interrupt injected while the routine was computing.
    pub fn checkpoint(&self) -> Result<(), RuntimeError> {
        match self.core.parking.lock().injected.take() {
            Some(signal) => Err(RuntimeError::Interrupted(signal)),
            None => Ok(()),
        }
    }

    pub(crate) fn enqueue(&self, signal: Signal) {
        self.core.enqueued.lock().push(signal);
    }

    pub(crate) fn mark_spawned(&self) -> Result<(), RuntimeError> {
        let mut state = self.core.state.lock();
        if *state != RoutineState::Unspawned {
            return Err(RuntimeError::AlreadySpawned);
        }
        *state = RoutineState::Spawned;
        Ok(())
    }

    pub(crate) fn mark_running(&self) {
        *self.core.state.lock() = RoutineState::Running;
        self.core.state_changed.notify_all();
    }

    pub(crate) fn mark_completed(&self) {
        let mut state = self.core.state.lock();
        *state = RoutineState::Completed;
        self.core.state_changed.notify_all();

        if let Some(signal) = self.core.parking.lock().injected.take() {
            debug!(
                routine = %self.core.name,
                %signal,
                "routine completed before an injected interrupt surfaced; dropping it"
            );
        }
    }

    /// Link the routine to the event it is about to block on.
    ///
    /// Entering a wait is a safe point, so a pending injected interrupt is
    /// raised here instead.
    pub(crate) fn park(&self, event: &Arc<Event>) -> Result<ParkLink<'_>, RuntimeError> {
        let mut parking = self.core.parking.lock();
        if let Some(signal) = parking.injected.take() {
            return Err(RuntimeError::Interrupted(signal));
        }
        if parking.waiting.is_some() {
            return Err(RuntimeError::AlreadyWaiting);
        }
        parking.waiting = Some(Arc::clone(event));
        Ok(ParkLink { core: &self.core })
    }

    /// Deliver `signal` with raise semantics.
    ///
    /// A parked routine is woken inside its wait; a computing one gets the
    /// interrupt at its next safe point. A routine whose wait has already
    /// been satisfied counts as computing. Blocks while the routine is queued
    /// but not yet running.
    pub(crate) fn raise_interrupt(&self, signal: Signal) -> Result<Delivery, RuntimeError> {
        let mut state = self.core.state.lock();
        loop {
            match *state {
                RoutineState::Unspawned => return Err(RuntimeError::NotSpawned),
                RoutineState::Completed => return Err(RuntimeError::Finished),
                RoutineState::Spawned => self.core.state_changed.wait(&mut state),
                RoutineState::Running => break,
            }
        }

        let mut parking = self.core.parking.lock();
        if let Some(event) = &parking.waiting {
            if event.interrupt(signal) {
                return Ok(Delivery::Parked);
            }
            debug!(
                routine = %self.core.name,
                %signal,
                "wait already satisfied; deferring interrupt to the next safe point"
            );
        }
        parking.injected = Some(signal);
        Ok(Delivery::Injected)
    }
}

impl PartialEq for RoutineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for RoutineHandle {}

impl std::fmt::Debug for RoutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineHandle")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the routine's wait target when the wait ends, however it ends.
pub(crate) struct ParkLink<'a> {
    core: &'a RoutineCore,
}

impl Drop for ParkLink<'_> {
    fn drop(&mut self) {
        self.core.parking.lock().waiting = None;
    }
}

/// Anything that can be spawned once resolution fires.
pub(crate) trait Spawn: Send + Sync {
    fn spawn(&self) -> Result<(), RuntimeError>;
    fn name(&self) -> &str;
}

type Body<T> = Box<dyn FnOnce() -> Result<T, Failure> + Send>;

/// A named callable bound to a scheduler.
///
/// The routine owns the promise of its result; [`Routine::future`] hands out
/// wait handles on it. Cloning yields another handle to the same routine.
pub struct Routine<T> {
    handle: RoutineHandle,
    scheduler: SchedulerHandle,
    promise: Promise<T>,
    body: Arc<Mutex<Option<Body<T>>>>,
}

impl<T> Routine<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<F>(scheduler: &SchedulerHandle, name: String, func: F) -> Result<Self, RuntimeError>
    where
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        let promise = Promise::new(scheduler)?;
        Ok(Self::with_promise(scheduler, name, promise, Box::new(func)))
    }

    /// Build a routine on behalf of a worker, skipping the thread check.
    pub(crate) fn new_unchecked<F>(scheduler: &SchedulerHandle, name: String, func: F) -> Self
    where
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        let promise = Promise::new_unchecked(scheduler);
        Self::with_promise(scheduler, name, promise, Box::new(func))
    }

    fn with_promise(scheduler: &SchedulerHandle, name: String, promise: Promise<T>, body: Body<T>) -> Self {
        Self {
            handle: RoutineHandle::with_state(name, RoutineState::Unspawned),
            scheduler: scheduler.clone(),
            promise,
            body: Arc::new(Mutex::new(Some(body))),
        }
    }

    pub fn id(&self) -> RoutineId {
        self.handle.id()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &RoutineHandle {
        &self.handle
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn state(&self) -> RoutineState {
        self.handle.state()
    }

    pub fn is_spawned(&self) -> bool {
        self.handle.is_spawned()
    }

    pub fn get_interrupt(&self, signal: Signal) -> InterruptPolicy {
        self.handle.get_interrupt(signal)
    }

    pub fn set_interrupt(&self, signal: Signal, policy: InterruptPolicy) -> Option<InterruptPolicy> {
        self.handle.set_interrupt(signal, policy)
    }

    /// Queue the routine on a worker. Fails if it was spawned before.
    pub fn spawn(&self) -> Result<(), RuntimeError> {
        self.handle.mark_spawned()?;
        let body = self.body.lock().take().ok_or(RuntimeError::AlreadySpawned)?;

        self.scheduler.submit(Box::new(RoutineTask {
            routine: self.handle.clone(),
            body: Some(body),
            promise: self.promise.clone(),
        }))
    }

    /// A wait handle on this routine's result, owned by the calling routine.
    pub fn future(&self) -> Result<Future<T>, RuntimeError> {
        self.promise.future()
    }
}

impl<T> Clone for Routine<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            scheduler: self.scheduler.clone(),
            promise: self.promise.clone(),
            body: Arc::clone(&self.body),
        }
    }
}

impl<T> std::fmt::Debug for Routine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine")
            .field("id", &self.handle.id())
            .field("name", &self.handle.name())
            .field("state", &self.handle.state())
            .finish()
    }
}

impl<T> Spawn for Routine<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn spawn(&self) -> Result<(), RuntimeError> {
        Routine::spawn(self)
    }

    fn name(&self) -> &str {
        self.handle.name()
    }
}

/// The queued form of a spawned routine.
///
/// A task dropped without running (its worker already gone) fails its
/// promise with `Shutdown` so waiters are not left hanging.
struct RoutineTask<T: Clone + Send + Sync + 'static> {
    routine: RoutineHandle,
    body: Option<Body<T>>,
    promise: Promise<T>,
}

impl<T> Runnable for RoutineTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn routine(&self) -> &RoutineHandle {
        &self.routine
    }

    fn run(mut self: Box<Self>) {
        let Some(body) = self.body.take() else {
            return;
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(outcome) => outcome,
            Err(payload) => Err(Failure::new(RuntimeError::Panicked(panic_message(&*payload)))),
        };

        match outcome {
            Ok(value) => self.promise.set_result(value),
            Err(failure) => self.promise.set_exception(failure),
        };
        self.routine.mark_completed();
    }

    fn reject(mut self: Box<Self>, error: RuntimeError) {
        if self.body.take().is_some() {
            self.promise.set_exception(error);
            self.routine.mark_completed();
        }
    }
}

impl<T> Drop for RoutineTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.body.take().is_some() {
            self.promise.set_exception(RuntimeError::Shutdown);
            self.routine.mark_completed();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Default display name for a routine built from `F`.
pub(crate) fn default_name<F>() -> String {
    type_name::<F>().to_string()
}
