//! Worker threads and interrupt endpoints.
//!
//! Each worker owns a private FIFO queue and runs one routine at a time to
//! completion. Its [`Endpoint`] records which routine is current, which is
//! what makes per-routine interrupt routing possible: a signal aimed at a
//! worker is resolved through the policy table of whatever routine that
//! worker is running at the moment.
//!
//! The home thread has an endpoint too; its current routine is always the
//! scheduler's root routine.

use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::RuntimeError;
use crate::interrupt::InterruptPolicy;
use crate::routine::{Delivery, Routine, RoutineHandle};
use crate::scheduler::{SchedulerHandle, SchedulerShared};
use crate::signal::Signal;

/// A unit of queued work.
pub(crate) trait Runnable: Send {
    fn routine(&self) -> &RoutineHandle;

    /// Run to completion, resolving the routine's promise.
    fn run(self: Box<Self>);

    /// Fail the routine without running it.
    fn reject(self: Box<Self>, error: RuntimeError);
}

pub(crate) enum QueueItem {
    Run(Box<dyn Runnable>),
    Shutdown,
}

/// The interrupt target for one participant thread.
pub(crate) struct Endpoint {
    name: String,
    current: Mutex<Option<RoutineHandle>>,
    scheduler: Weak<SchedulerShared>,
}

impl Endpoint {
    pub(crate) fn new(name: String, scheduler: Weak<SchedulerShared>) -> Self {
        Self {
            name,
            current: Mutex::new(None),
            scheduler,
        }
    }

    /// An endpoint permanently running `root`.
    pub(crate) fn home(root: RoutineHandle, scheduler: Weak<SchedulerShared>) -> Self {
        Self {
            name: root.name().to_string(),
            current: Mutex::new(Some(root)),
            scheduler,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn current(&self) -> Option<RoutineHandle> {
        self.current.lock().clone()
    }

    pub(crate) fn is_running(&self, routine: &RoutineHandle) -> bool {
        self.current.lock().as_ref() == Some(routine)
    }

    /// Make `routine` current for as long as the returned guard lives.
    pub(crate) fn assign(&self, routine: &RoutineHandle) -> Result<Assignment<'_>, RuntimeError> {
        let mut current = self.current.lock();
        if let Some(running) = current.as_ref() {
            return Err(RuntimeError::WorkerBusy {
                worker: self.name.clone(),
                running: running.name().to_string(),
            });
        }

        routine.mark_running();
        *current = Some(routine.clone());
        trace!(worker = %self.name, routine = %routine.name(), "routine assigned");

        Ok(Assignment { endpoint: self })
    }

    /// Route `signal` to whichever routine this endpoint is running.
    pub(crate) fn interrupt(&self, signal: Signal) {
        match self.current() {
            Some(routine) => self.deliver(&routine, signal),
            None => trace!(worker = %self.name, %signal, "no routine to interrupt"),
        }
    }

    /// Resolve `signal` through `routine`'s policy table.
    pub(crate) fn deliver(&self, routine: &RoutineHandle, signal: Signal) {
        match routine.get_interrupt(signal) {
            InterruptPolicy::Ignore => {
                trace!(routine = %routine.name(), %signal, "interrupt ignored");
            }
            InterruptPolicy::Enqueue => routine.enqueue(signal),
            InterruptPolicy::Handler(handler) => {
                let Some(shared) = self.scheduler.upgrade() else {
                    debug!(routine = %routine.name(), %signal, "scheduler gone; dropping interrupt");
                    return;
                };
                let scheduler = SchedulerHandle::from_shared(shared);
                let name = format!("{}:{}", routine.name(), signal);
                let task = Routine::new_unchecked(&scheduler, name, move || handler(signal));
                if let Err(err) = task.spawn() {
                    warn!(routine = %task.name(), error = %err, "failed to spawn interrupt handler");
                }
            }
            InterruptPolicy::Raise => match routine.raise_interrupt(signal) {
                Ok(Delivery::Parked) => {
                    trace!(routine = %routine.name(), %signal, "interrupt delivered to parked wait");
                }
                Ok(Delivery::Injected) => {
                    trace!(routine = %routine.name(), %signal, "interrupt injected");
                }
                Err(err) => {
                    warn!(
                        routine = %routine.name(),
                        %signal,
                        error = %err,
                        "failed to raise interrupt due to race condition"
                    );
                }
            },
        }
    }
}

/// Clears the endpoint's current routine on drop.
pub(crate) struct Assignment<'a> {
    endpoint: &'a Endpoint,
}

impl Drop for Assignment<'_> {
    fn drop(&mut self) {
        self.endpoint.current.lock().take();
    }
}

pub(crate) struct WorkerSlot {
    pub(crate) endpoint: Arc<Endpoint>,
    pub(crate) sender: Sender<QueueItem>,
}

impl WorkerSlot {
    pub(crate) fn is_idle(&self) -> bool {
        self.sender.is_empty() && self.endpoint.current.lock().is_none()
    }
}

/// Worker thread loop.
///
/// The shutdown marker is always the last item a worker receives, so every
/// routine queued before shutdown runs before the loop exits.
pub(crate) fn worker_loop(scheduler: SchedulerHandle, endpoint: Arc<Endpoint>, queue: Receiver<QueueItem>) {
    debug!(worker = %endpoint.name(), "worker started");

    while let Ok(item) = queue.recv() {
        match item {
            QueueItem::Run(task) => run_task(&endpoint, task),
            QueueItem::Shutdown => break,
        }
    }

    scheduler.unregister_current();
    debug!(worker = %endpoint.name(), "worker stopped");
}

fn run_task(endpoint: &Endpoint, task: Box<dyn Runnable>) {
    let routine = task.routine().clone();
    let assignment = match endpoint.assign(&routine) {
        Ok(assignment) => assignment,
        Err(err) => {
            error!(worker = %endpoint.name(), routine = %routine.name(), error = %err, "refusing routine");
            task.reject(err);
            return;
        }
    };

    task.run();
    trace!(worker = %endpoint.name(), routine = %routine.name(), "routine completed");
    drop(assignment);
}

/// Public view of one worker thread.
#[derive(Clone)]
pub struct WorkerHandle {
    index: usize,
    endpoint: Arc<Endpoint>,
    sender: Sender<QueueItem>,
}

impl WorkerHandle {
    pub(crate) fn new(index: usize, slot: &WorkerSlot) -> Self {
        Self {
            index,
            endpoint: Arc::clone(&slot.endpoint),
            sender: slot.sender.clone(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Thread name of the worker.
    pub fn name(&self) -> &str {
        self.endpoint.name()
    }

    /// The routine the worker is running right now.
    pub fn current_routine(&self) -> Option<RoutineHandle> {
        self.endpoint.current()
    }

    /// Number of routines waiting in the worker's queue.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queued() == 0 && self.current_routine().is_none()
    }

    /// Route `signal` to the worker's current routine, if any.
    pub fn interrupt(&self, signal: Signal) {
        self.endpoint.interrupt(signal);
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .field("name", &self.endpoint.name())
            .field("queued", &self.queued())
            .finish()
    }
}
