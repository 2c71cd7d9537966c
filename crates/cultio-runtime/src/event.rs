//! Blocking wait primitive backing every future.
//!
//! An [`Event`] is set at most once. A parked waiter wakes up when the event
//! is set, when an interrupt is pushed into it, or when its timeout runs out.
//! An interrupt delivered before the event is set wins over a later set, so a
//! routine interrupted while its promise resolves still observes it. Once the
//! event is set, further interrupts are refused: the waiter may already have
//! returned and would never see them.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::signal::Signal;

/// Result of a blocking wait on an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event was set.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// An interrupt was delivered to the waiter.
    Interrupted(Signal),
}

#[derive(Default)]
struct EventState {
    signaled: bool,
    interrupt: Option<Signal>,
}

/// A set-once event that can also carry an interrupt.
#[derive(Default)]
pub struct Event {
    state: Mutex<EventState>,
    changed: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once `set` has been called.
    pub fn is_set(&self) -> bool {
        self.state.lock().signaled
    }

    /// The interrupt delivered to this event, if any.
    pub fn interrupted(&self) -> Option<Signal> {
        self.state.lock().interrupt
    }

    /// Set the event and wake every waiter.
    pub fn set(&self) {
        self.state.lock().signaled = true;
        self.changed.notify_all();
    }

    /// Deliver an interrupt and wake every waiter.
    ///
    /// Only the first interrupt is kept. Returns false, storing nothing, if
    /// the event is already set.
    pub fn interrupt(&self, signal: Signal) -> bool {
        {
            let mut state = self.state.lock();
            if state.signaled {
                return false;
            }
            state.interrupt.get_or_insert(signal);
        }
        self.changed.notify_all();
        true
    }

    /// Block until the event is set or interrupted, or `timeout` elapses.
    ///
    /// `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.state.lock();

        loop {
            if let Some(signal) = state.interrupt {
                return WaitOutcome::Interrupted(signal);
            }
            if state.signaled {
                return WaitOutcome::Signaled;
            }

            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return match state.interrupt {
                            Some(signal) => WaitOutcome::Interrupted(signal),
                            None if state.signaled => WaitOutcome::Signaled,
                            None => WaitOutcome::TimedOut,
                        };
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Event")
            .field("signaled", &state.signaled)
            .field("interrupt", &state.interrupt)
            .finish()
    }
}
