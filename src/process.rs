use std::fmt;
use std::io;

use subspawn_core::{ExitReason, ProcessError, ProcessState};
use tracing::{debug, warn};

use crate::sys;

/// The OS half of a process record. The real implementations live in
/// `sys::{unix, windows}`; tests substitute a scripted double.
pub trait OsProcess {
    fn id(&self) -> u32;
    /// Non-blocking status check; `None` while running.
    fn try_wait(&mut self) -> io::Result<Option<ProcessState>>;
    /// Block until the process changes to a terminal state.
    fn wait(&mut self) -> io::Result<ProcessState>;
    fn send_signal(&mut self, signal: i32) -> Result<(), ProcessError>;
    /// Last-chance collection when the record is dropped unfinished. Returns
    /// `false` if the process is still running.
    fn reap_on_drop(&mut self) -> bool;
}

/// A spawned child and its cached status.
///
/// Once a terminal state has been observed it is never queried from the OS
/// again: repeated `wait`/`poll` calls return the cached reason.
#[derive(Debug)]
pub struct Process<H: OsProcess = sys::Child> {
    handle: H,
    state: ProcessState,
}

impl<H: OsProcess> Process<H> {
    pub fn from_handle(handle: H) -> Self {
        Process {
            handle,
            state: ProcessState::Running,
        }
    }

    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    /// Cached exit reason; `None` until a poll or wait has observed the exit.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.state.exit_reason()
    }

    fn record(&mut self, state: ProcessState) -> Option<ExitReason> {
        if state.is_terminal() {
            debug!(pid = self.id(), ?state, "process finished");
            self.state = state;
        }
        state.exit_reason()
    }

    /// Check without blocking. `Ok(None)` means still running.
    pub fn poll(&mut self) -> Result<Option<ExitReason>, ProcessError> {
        if self.is_done() {
            return Ok(self.exit_reason());
        }
        match self.handle.try_wait().map_err(ProcessError::Wait)? {
            Some(state) => Ok(self.record(state)),
            None => Ok(None),
        }
    }

    /// Block until the process finishes.
    pub fn wait(&mut self) -> Result<ExitReason, ProcessError> {
        if let Some(reason) = self.exit_reason() {
            return Ok(reason);
        }
        let state = self.handle.wait().map_err(ProcessError::Wait)?;
        // A wait that returns keeps the record terminal even on odd statuses.
        let state = match state {
            ProcessState::Running => ProcessState::Unknown,
            other => other,
        };
        Ok(self.record(state).unwrap_or(ExitReason::exited(1)))
    }

    /// Deliver `signal`, then poll once. A finished record ignores signals.
    pub fn send_signal(&mut self, signal: i32) -> Result<Option<ExitReason>, ProcessError> {
        if self.is_done() {
            return Ok(self.exit_reason());
        }
        self.handle.send_signal(signal)?;
        self.poll()
    }

    /// Ask the process to exit (SIGTERM on Unix).
    pub fn terminate(&mut self) -> Result<Option<ExitReason>, ProcessError> {
        self.send_signal(sys::TERMINATE_SIGNAL)
    }

    /// Kill unconditionally and wait for the kill to take effect.
    pub fn kill(&mut self) -> Result<ExitReason, ProcessError> {
        if let Some(reason) = self.exit_reason() {
            return Ok(reason);
        }
        self.handle.send_signal(sys::KILL_SIGNAL)?;
        self.wait()
    }
}

impl<H: OsProcess> fmt::Display for Process<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subprocess ({})", self.id())
    }
}

impl<H: OsProcess> Drop for Process<H> {
    fn drop(&mut self) {
        if self.is_done() {
            return;
        }
        if !self.handle.reap_on_drop() {
            warn!(
                pid = self.id(),
                "process dropped while still running; it will linger as a zombie once it exits"
            );
        }
    }
}
