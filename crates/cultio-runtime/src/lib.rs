//! Cultio - a thread-pool routine scheduler with interrupt routing
//!
//! This crate provides:
//! - `Scheduler` - a bounded pool of worker threads plus the home thread
//! - `Routine<T>` - a named unit of work with its own interrupt policy
//! - `Promise<T>` - the single-assignment result or failure of a routine
//! - `Future<T>` - a wait handle only the owning routine may block on
//! - `Signal` / `InterruptPolicy` - per-routine interrupt handling
//!
//! # Design
//!
//! - Real OS threads; each worker runs one routine to completion at a time
//! - A routine only suspends inside `Future::wait`
//! - Promise resolution atomically hands off to continuation routines
//! - An interrupt sent to a thread reaches the routine that thread is
//!   running, waking it in place if it is parked on a future
//!
//! # Example
//!
//! ```rust
//! use cultio::{Promise, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::with_config(
//!     SchedulerConfig::new().with_max_workers(1).allow_any_home_thread(),
//! ).unwrap();
//!
//! let a = scheduler.routine(|| Ok(21)).unwrap();
//! let b = a
//!     .future()
//!     .unwrap()
//!     .callback_routine(|p: Promise<i32>| Ok(p.get()? * 2))
//!     .unwrap();
//! a.spawn().unwrap();
//!
//! assert_eq!(b.future().unwrap().wait(None).unwrap(), 42);
//! ```

pub mod error;
pub mod event;
pub mod future;
pub mod interrupt;
pub mod promise;
pub mod routine;
pub mod scheduler;
pub mod signal;
pub mod worker;

pub use error::{Failure, RuntimeError};
pub use event::{Event, WaitOutcome};
pub use future::Future;
pub use interrupt::{InterruptHandler, InterruptPolicy, InterruptTable};
pub use promise::Promise;
pub use routine::{Routine, RoutineHandle, RoutineId, RoutineState};
pub use scheduler::{default_max_workers, Scheduler, SchedulerHandle};
pub use signal::{valid_signals, Signal};
pub use worker::WorkerHandle;

/// Configuration for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads; `None` uses [`default_max_workers`].
    /// Zero is raised to one.
    pub max_workers: Option<usize>,
    /// Name prefix for worker threads
    pub thread_name_prefix: String,
    /// Stack size for worker threads (bytes)
    pub stack_size: Option<usize>,
    /// Refuse construction anywhere but the process main thread
    pub require_main_thread: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            thread_name_prefix: "cultio-worker".to_string(),
            stack_size: None,
            require_main_thread: true,
        }
    }
}

impl SchedulerConfig {
    /// Create a new scheduler configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads. Values below one become one.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for worker threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Let the constructing thread act as the home thread, main or not.
    pub fn allow_any_home_thread(mut self) -> Self {
        self.require_main_thread = false;
        self
    }
}
