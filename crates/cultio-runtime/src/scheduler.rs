//! The scheduler: a bounded pool of worker threads plus the home thread.
//!
//! The scheduler is the single authority on which threads are participants.
//! The home thread and every live worker are participants; promises,
//! routines and futures can only be created on them. Interrupts are routed
//! through per-thread endpoints to whichever routine a thread is running.
//!
//! # Example
//!
//! ```rust
//! use cultio::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::with_config(
//!     SchedulerConfig::new().with_max_workers(2).allow_any_home_thread(),
//! ).unwrap();
//!
//! let routine = scheduler.routine(|| Ok(20 + 22)).unwrap();
//! routine.spawn().unwrap();
//! assert_eq!(routine.future().unwrap().wait(None).unwrap(), 42);
//! ```

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::unbounded;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Failure, RuntimeError};
use crate::promise::Promise;
use crate::routine::{default_name, Routine, RoutineHandle};
use crate::signal::Signal;
use crate::worker::{worker_loop, Endpoint, QueueItem, Runnable, WorkerHandle, WorkerSlot};
use crate::SchedulerConfig;

/// Upper bound on the default pool size.
const MAX_DEFAULT_WORKERS: usize = 32;

/// The pool size used when none is configured: `min(32, parallelism + 4)`.
pub fn default_max_workers() -> usize {
    let parallelism = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    MAX_DEFAULT_WORKERS.min(parallelism + 4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Participant {
    Home,
    Worker(usize),
}

pub(crate) struct SchedulerShared {
    participants: RwLock<HashMap<ThreadId, Participant>>,
    home: Arc<Endpoint>,
    root: RoutineHandle,
    workers: Vec<WorkerSlot>,
    /// Held for reading across every submission and for writing while the
    /// shutdown markers go out, so no task can be queued behind a marker.
    shutdown: RwLock<bool>,
}

/// A cloneable reference to a running scheduler.
///
/// Routines, promises and futures hold one of these. It does not keep the
/// worker threads alive; only the owning [`Scheduler`] controls shutdown.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    pub(crate) fn from_shared(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    /// Create an unspawned routine named after the closure type.
    pub fn routine<T, F>(&self, func: F) -> Result<Routine<T>, RuntimeError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        self.routine_named(default_name::<F>(), func)
    }

    /// Create an unspawned routine with an explicit name.
    pub fn routine_named<T, F>(&self, name: impl Into<String>, func: F) -> Result<Routine<T>, RuntimeError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        Routine::new(self, name.into(), func)
    }

    /// Create an unresolved promise. Only participants may call this.
    pub fn promise<T>(&self) -> Result<Promise<T>, RuntimeError>
    where
        T: Clone + Send + Sync + 'static,
    {
        Promise::new(self)
    }

    fn participant(&self) -> Option<Participant> {
        self.shared
            .participants
            .read()
            .get(&thread::current().id())
            .copied()
    }

    /// Returns true on the home thread and on live workers.
    pub fn is_participant(&self) -> bool {
        self.participant().is_some()
    }

    pub(crate) fn ensure_participant(&self) -> Result<(), RuntimeError> {
        if self.is_participant() {
            Ok(())
        } else {
            Err(RuntimeError::NotParticipant)
        }
    }

    /// The routine running on the calling thread.
    pub fn current_routine(&self) -> Result<RoutineHandle, RuntimeError> {
        match self.participant() {
            Some(Participant::Home) => Ok(self.shared.root.clone()),
            Some(Participant::Worker(index)) => self
                .shared
                .workers
                .get(index)
                .and_then(|slot| slot.endpoint.current())
                .ok_or(RuntimeError::NoRoutine),
            None => Err(RuntimeError::NotParticipant),
        }
    }

    /// Safe point for the calling routine; see [`RoutineHandle::checkpoint`].
    pub fn checkpoint(&self) -> Result<(), RuntimeError> {
        self.current_routine()?.checkpoint()
    }

    /// Route `signal` to `routine` through the endpoint running it.
    ///
    /// Returns false if no participant thread is running the routine.
    pub fn interrupt(&self, routine: &RoutineHandle, signal: Signal) -> bool {
        let endpoint = std::iter::once(&self.shared.home)
            .chain(self.shared.workers.iter().map(|slot| &slot.endpoint))
            .find(|endpoint| endpoint.is_running(routine));

        match endpoint {
            Some(endpoint) => {
                endpoint.deliver(routine, signal);
                true
            }
            None => false,
        }
    }

    /// Route `signal` to the home thread's root routine.
    pub fn interrupt_home(&self, signal: Signal) {
        self.shared.home.interrupt(signal);
    }

    /// The root routine standing for the home thread.
    pub fn home_routine(&self) -> RoutineHandle {
        self.shared.root.clone()
    }

    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.shared
            .workers
            .iter()
            .enumerate()
            .map(|(index, slot)| WorkerHandle::new(index, slot))
            .collect()
    }

    pub fn max_workers(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shared.shutdown.read()
    }

    /// Queue a task, preferring an idle worker.
    pub(crate) fn submit(&self, task: Box<dyn Runnable>) -> Result<(), RuntimeError> {
        let rejected = {
            let stopped = self.shared.shutdown.read();
            if *stopped {
                Some(task)
            } else {
                let workers = &self.shared.workers;
                let start = (task.routine().id().as_u64() % workers.len() as u64) as usize;
                let slot = (0..workers.len())
                    .map(|offset| &workers[(start + offset) % workers.len()])
                    .find(|slot| slot.is_idle())
                    .unwrap_or(&workers[start]);

                match slot.sender.send(QueueItem::Run(task)) {
                    Ok(()) => return Ok(()),
                    Err(err) => match err.into_inner() {
                        QueueItem::Run(task) => Some(task),
                        QueueItem::Shutdown => None,
                    },
                }
            }
        };

        // Rejection resolves a promise, which may submit callbacks; the
        // guard must be released first.
        if let Some(task) = rejected {
            task.reject(RuntimeError::Shutdown);
        }
        Err(RuntimeError::Shutdown)
    }

    pub(crate) fn unregister_current(&self) {
        self.shared.participants.write().remove(&thread::current().id());
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("max_workers", &self.max_workers())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Owner of a scheduler and its worker threads.
///
/// Dereferences to [`SchedulerHandle`]. Dropping it shuts the pool down and
/// joins every worker.
pub struct Scheduler {
    handle: SchedulerHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with the default configuration.
    ///
    /// Must be called on the process main thread.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with a specific number of workers.
    pub fn with_workers(max_workers: usize) -> Result<Self, RuntimeError> {
        Self::with_config(SchedulerConfig::new().with_max_workers(max_workers))
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self, RuntimeError> {
        if config.require_main_thread && !is_main_thread() {
            return Err(RuntimeError::NotMainThread);
        }

        let max_workers = config.max_workers.unwrap_or_else(default_max_workers).max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..max_workers).map(|_| unbounded()).unzip();
        let root = RoutineHandle::root("main");

        let shared = Arc::new_cyclic(|weak: &Weak<SchedulerShared>| {
            let workers = senders
                .into_iter()
                .enumerate()
                .map(|(index, sender)| WorkerSlot {
                    endpoint: Arc::new(Endpoint::new(
                        format!("{}-{}", config.thread_name_prefix, index),
                        weak.clone(),
                    )),
                    sender,
                })
                .collect();

            let mut participants = HashMap::new();
            participants.insert(thread::current().id(), Participant::Home);

            SchedulerShared {
                participants: RwLock::new(participants),
                home: Arc::new(Endpoint::home(root.clone(), weak.clone())),
                root,
                workers,
                shutdown: RwLock::new(false),
            }
        });

        let scheduler = Scheduler {
            handle: SchedulerHandle::from_shared(shared),
            threads: Mutex::new(Vec::with_capacity(max_workers)),
        };

        for (index, queue) in receivers.into_iter().enumerate() {
            let endpoint = Arc::clone(&scheduler.handle.shared.workers[index].endpoint);
            let mut builder = thread::Builder::new().name(endpoint.name().to_string());
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }

            let handle = scheduler.handle.clone();
            let thread = builder
                .spawn(move || worker_loop(handle, endpoint, queue))
                .map_err(|err| RuntimeError::SpawnFailed(err.to_string()))?;

            scheduler
                .handle
                .shared
                .participants
                .write()
                .insert(thread.thread().id(), Participant::Worker(index));
            scheduler.threads.lock().push(thread);
        }

        debug!(workers = max_workers, "scheduler started");
        Ok(scheduler)
    }

    /// A cloneable handle to this scheduler.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop accepting work, let every worker drain its queue, and join them.
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut stopped = self.handle.shared.shutdown.write();
            if *stopped {
                return;
            }
            *stopped = true;

            for slot in &self.handle.shared.workers {
                let remaining = slot.sender.len();
                if remaining > 0 {
                    warn!(worker = %slot.endpoint.name(), remaining, "shutting down worker with non-empty queue");
                }
                let _ = slot.sender.send(QueueItem::Shutdown);
            }
        }

        let current = thread::current().id();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            let name = thread.thread().name().unwrap_or("<unnamed>").to_string();
            if thread.join().is_err() {
                warn!(worker = %name, "worker thread panicked");
            }
        }

        debug!("scheduler shut down");
    }
}

impl Deref for Scheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &SchedulerHandle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Scheduler").field(&self.handle).finish()
    }
}

#[cfg(target_os = "linux")]
fn is_main_thread() -> bool {
    // SAFETY: neither call has preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t == libc::getpid() }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn is_main_thread() -> bool {
    // SAFETY: no preconditions.
    unsafe { libc::pthread_main_np() != 0 }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
fn is_main_thread() -> bool {
    thread::current().name() == Some("main")
}
