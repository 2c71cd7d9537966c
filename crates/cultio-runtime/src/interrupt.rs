//! Per-routine interrupt policies.
//!
//! Every routine carries an [`InterruptTable`] that maps a [`Signal`] to how
//! the routine wants to react when that signal is routed to it. Signals
//! without an entry use [`InterruptPolicy::Raise`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Failure;
use crate::signal::Signal;

/// Callback run as a fresh routine when a signal with a handler policy arrives.
pub type InterruptHandler = Arc<dyn Fn(Signal) -> Result<(), Failure> + Send + Sync>;

/// How a routine reacts to an interrupt.
#[derive(Clone, Default)]
pub enum InterruptPolicy {
    /// Drop the interrupt.
    Ignore,
    /// Fail the routine with `RuntimeError::Interrupted`, either inside a
    /// parked `wait()` or at its next safe point.
    #[default]
    Raise,
    /// Record the interrupt on the routine without disturbing it.
    Enqueue,
    /// Spawn the handler as a new routine; the interrupted one keeps going.
    Handler(InterruptHandler),
}

impl InterruptPolicy {
    /// Build a handler policy from a closure.
    pub fn handler<F>(handler: F) -> Self
    where
        F: Fn(Signal) -> Result<(), Failure> + Send + Sync + 'static,
    {
        InterruptPolicy::Handler(Arc::new(handler))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, InterruptPolicy::Ignore)
    }

    pub fn is_enqueue(&self) -> bool {
        matches!(self, InterruptPolicy::Enqueue)
    }
}

impl fmt::Debug for InterruptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptPolicy::Ignore => f.write_str("Ignore"),
            InterruptPolicy::Raise => f.write_str("Raise"),
            InterruptPolicy::Enqueue => f.write_str("Enqueue"),
            InterruptPolicy::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Signal to policy lookup for one routine.
#[derive(Debug, Clone, Default)]
pub struct InterruptTable {
    policies: HashMap<Signal, InterruptPolicy>,
}

impl InterruptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The policy for `signal`, falling back to `Raise`.
    pub fn get(&self, signal: Signal) -> InterruptPolicy {
        self.policies.get(&signal).cloned().unwrap_or_default()
    }

    /// Install a policy, returning the one it replaced.
    pub fn set(&mut self, signal: Signal, policy: InterruptPolicy) -> Option<InterruptPolicy> {
        self.policies.insert(signal, policy)
    }

    /// Go back to the default policy for `signal`.
    pub fn reset(&mut self, signal: Signal) -> Option<InterruptPolicy> {
        self.policies.remove(&signal)
    }

    pub fn is_ignored(&self, signal: Signal) -> bool {
        self.policies.get(&signal).is_some_and(InterruptPolicy::is_ignore)
    }

    pub fn is_enqueued(&self, signal: Signal) -> bool {
        self.policies.get(&signal).is_some_and(InterruptPolicy::is_enqueue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SIGINT, SIGTERM};

    #[test]
    fn test_default_policy_is_raise() {
        let table = InterruptTable::new();
        assert!(matches!(table.get(SIGINT), InterruptPolicy::Raise));
        assert!(!table.is_ignored(SIGINT));
        assert!(!table.is_enqueued(SIGINT));
    }

    #[test]
    fn test_set_and_reset() {
        let mut table = InterruptTable::new();

        assert!(table.set(SIGTERM, InterruptPolicy::Ignore).is_none());
        assert!(table.is_ignored(SIGTERM));
        assert!(!table.is_ignored(SIGINT));

        let previous = table.set(SIGTERM, InterruptPolicy::Enqueue);
        assert!(matches!(previous, Some(InterruptPolicy::Ignore)));
        assert!(table.is_enqueued(SIGTERM));

        table.reset(SIGTERM);
        assert!(matches!(table.get(SIGTERM), InterruptPolicy::Raise));
    }

    #[test]
    fn test_handler_policy() {
        let mut table = InterruptTable::new();
        table.set(SIGINT, InterruptPolicy::handler(|_| Ok(())));

        match table.get(SIGINT) {
            InterruptPolicy::Handler(handler) => assert!(handler(SIGINT).is_ok()),
            other => panic!("expected handler, got {:?}", other),
        }
        assert_eq!(format!("{:?}", table.get(SIGINT)), "Handler(..)");
    }
}
