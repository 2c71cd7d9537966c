//! Interrupt identifiers.
//!
//! A [`Signal`] is a platform signal number that has been checked against
//! the set the host knows about. Only validated values can be built outside
//! this module, so policy tables and routers never see an unknown signal.

use std::fmt;

use crate::error::RuntimeError;

/// A validated interrupt identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signal(i32);

macro_rules! signals {
    ($($name:ident = $value:expr;)*) => {
        $(
            #[doc = concat!("The `", stringify!($name), "` interrupt.")]
            pub const $name: Signal = Signal($value);
        )*

        const KNOWN: &[(Signal, &str)] = &[$(($name, stringify!($name)),)*];
    };
}

#[cfg(unix)]
signals! {
    SIGHUP = libc::SIGHUP;
    SIGINT = libc::SIGINT;
    SIGQUIT = libc::SIGQUIT;
    SIGILL = libc::SIGILL;
    SIGTRAP = libc::SIGTRAP;
    SIGABRT = libc::SIGABRT;
    SIGBUS = libc::SIGBUS;
    SIGFPE = libc::SIGFPE;
    SIGKILL = libc::SIGKILL;
    SIGUSR1 = libc::SIGUSR1;
    SIGSEGV = libc::SIGSEGV;
    SIGUSR2 = libc::SIGUSR2;
    SIGPIPE = libc::SIGPIPE;
    SIGALRM = libc::SIGALRM;
    SIGTERM = libc::SIGTERM;
    SIGCHLD = libc::SIGCHLD;
    SIGCONT = libc::SIGCONT;
    SIGSTOP = libc::SIGSTOP;
    SIGTSTP = libc::SIGTSTP;
    SIGTTIN = libc::SIGTTIN;
    SIGTTOU = libc::SIGTTOU;
    SIGURG = libc::SIGURG;
    SIGXCPU = libc::SIGXCPU;
    SIGXFSZ = libc::SIGXFSZ;
    SIGVTALRM = libc::SIGVTALRM;
    SIGPROF = libc::SIGPROF;
    SIGWINCH = libc::SIGWINCH;
    SIGSYS = libc::SIGSYS;
}

// The CRT only defines a handful of signals on Windows.
#[cfg(windows)]
signals! {
    SIGINT = 2;
    SIGILL = 4;
    SIGFPE = 8;
    SIGSEGV = 11;
    SIGTERM = 15;
    SIGBREAK = 21;
    SIGABRT = 22;
}

impl Signal {
    /// Validate a raw signal number.
    pub fn new(raw: i32) -> Result<Self, RuntimeError> {
        KNOWN
            .iter()
            .map(|(signal, _)| *signal)
            .find(|signal| signal.0 == raw)
            .ok_or(RuntimeError::InvalidSignal(raw))
    }

    /// The raw platform signal number.
    pub fn as_raw(&self) -> i32 {
        self.0
    }

    /// The symbolic name, e.g. `"SIGINT"`.
    pub fn name(&self) -> &'static str {
        KNOWN
            .iter()
            .find(|(signal, _)| signal == self)
            .map(|(_, name)| *name)
            .unwrap_or("<unknown interrupt>")
    }
}

impl TryFrom<i32> for Signal {
    type Error = RuntimeError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Signal::new(raw)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every signal identifier known on this platform, in numeric order.
pub fn valid_signals() -> Vec<Signal> {
    let mut signals: Vec<Signal> = KNOWN.iter().map(|(signal, _)| *signal).collect();
    signals.sort();
    signals.dedup();
    signals
}
