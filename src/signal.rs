use std::{str::FromStr, sync::Arc, thread};

use log::{debug, warn};
use nix::{
    errno::Errno,
    libc::c_int,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use signal_hook::{consts::FORBIDDEN, iterator::Signals};

use crate::error::{Error, Result};

/// Signal sent by `kill` when the caller does not name one.
pub const DEFAULT_KILL_SIGNAL: Signal = Signal::SIGTERM;

/// Resolves `SIGTERM`, `TERM`, `term` or `15` to a signal.
pub fn convert(name: &str) -> Result<Signal> {
    let name = name.trim();
    let unknown = || Error::UnknownSignal(name.to_owned());

    if let Ok(number) = name.parse::<c_int>() {
        return Signal::try_from(number).map_err(|_| unknown());
    }

    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };

    Signal::from_str(&full).map_err(|_| unknown())
}

/// Delivers signals to processes.
pub trait Signaller: Send + Sync {
    fn deliver(&self, pid: i32, signal: Signal) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSignaller;

impl Signaller for ProcessSignaller {
    fn deliver(&self, pid: i32, signal: Signal) -> Result<()> {
        debug!(pid = pid, signal = signal.as_str(); "delivering signal");

        match signal::kill(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(Error::ProcessLookup(pid)),
            Err(err) => Err(err.into()),
        }
    }
}

/// Raised by this process's own children and sockets. Hooks still run after
/// the container exited, so their SIGCHLD would reach a stale pid.
const NOT_FORWARDED: [Signal; 2] = [Signal::SIGCHLD, Signal::SIGPIPE];

/// Every signal a process is allowed to install a handler for.
pub fn catchable() -> Vec<c_int> {
    Signal::iterator()
        .map(|signal| signal as c_int)
        .filter(|signal| !FORBIDDEN.contains(signal))
        .collect()
}

/// Catchable signals that concern the container rather than this process.
pub fn forwardable() -> Vec<c_int> {
    catchable()
        .into_iter()
        .filter(|signal| !NOT_FORWARDED.iter().any(|s| *s as c_int == *signal))
        .collect()
}

/// Redelivers every forwardable signal received by this process to `pid`.
///
/// The forwarding thread runs until the process exits; callers are expected
/// to drop the handle rather than join it.
pub fn forward_all(pid: i32, signaller: Arc<dyn Signaller>) -> Result<thread::JoinHandle<()>> {
    forward(pid, &forwardable(), signaller)
}

pub fn forward(
    pid: i32,
    signals: &[c_int],
    signaller: Arc<dyn Signaller>,
) -> Result<thread::JoinHandle<()>> {
    let mut signals = Signals::new(signals)?;

    let handle = thread::Builder::new()
        .name("signal-forward".to_owned())
        .spawn(move || {
            for raw in signals.forever() {
                let Ok(signal) = Signal::try_from(raw) else {
                    continue;
                };

                if let Err(err) = signaller.deliver(pid, signal) {
                    warn!(pid = pid, signal = signal.as_str(); "failed to forward signal: {err}");
                }
            }
        })?;

    Ok(handle)
}
