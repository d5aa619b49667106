use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// One of the three standard stream positions of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Stdin,
    Stdout,
    Stderr,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Stdin, Slot::Stdout, Slot::Stderr];

    /// Descriptor number the slot occupies in the child (0, 1 or 2).
    pub fn index(self) -> usize {
        match self {
            Slot::Stdin => 0,
            Slot::Stdout => 1,
            Slot::Stderr => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Slot::Stdin => "stdin",
            Slot::Stdout => "stdout",
            Slot::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded outcome of a finished process.
///
/// Non-negative values are normal exit codes; negative values mean the process
/// was terminated (or stopped) by the signal whose number is the negation.
/// This sign convention is part of the public contract. The value is wider
/// than an exit code so that every `u32` code (Windows exit codes and NTSTATUS
/// values such as `0xC0000005`) stays non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitReason(i64);

impl ExitReason {
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn exited(code: u32) -> Self {
        Self(code as i64)
    }

    pub const fn signaled(signal: i32) -> Self {
        Self(-(signal as i64))
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Exit code, if the process exited normally.
    pub fn code(self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }

    /// Signal number, if the process was ended by a signal.
    pub fn signal(self) -> Option<i32> {
        if self.0 < 0 {
            i32::try_from(-self.0).ok()
        } else {
            None
        }
    }

    pub fn success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal() {
            Some(sig) => write!(f, "signal {sig}"),
            None => write!(f, "exit code {}", self.0),
        }
    }
}

/// Cached state of a process record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Exited(u32),
    Signaled(i32),
    Stopped(i32),
    /// The OS reported a status change that is neither an exit nor a signal.
    Unknown,
}

impl ProcessState {
    /// Exit reason for a terminal state, `None` while running.
    pub fn exit_reason(self) -> Option<ExitReason> {
        match self {
            ProcessState::Running => None,
            ProcessState::Exited(code) => Some(ExitReason::exited(code)),
            ProcessState::Signaled(sig) | ProcessState::Stopped(sig) => {
                Some(ExitReason::signaled(sig))
            }
            ProcessState::Unknown => Some(ExitReason::exited(1)),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

/// Failures surfaced synchronously by a spawn call.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The request itself is malformed; no OS resource was touched.
    #[error("invalid spawn request: {0}")]
    Configuration(String),
    /// A descriptor or pipe could not be allocated while planning the child's streams.
    #[error("{step}: {source}")]
    Resource {
        step: String,
        #[source]
        source: io::Error,
    },
    /// The OS refused to create the process at all.
    #[error("process creation failed: {0}")]
    ProcessCreation(#[source] io::Error),
    /// The process was created but the program image failed to load.
    #[error("cannot execute {program}: {source}")]
    ExecutionStart {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SpawnError::Configuration(msg.into())
    }

    pub fn resource(step: impl Into<String>, source: io::Error) -> Self {
        SpawnError::Resource {
            step: step.into(),
            source,
        }
    }

    /// Underlying OS error code, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            SpawnError::Configuration(_) => None,
            SpawnError::Resource { source, .. }
            | SpawnError::ProcessCreation(source)
            | SpawnError::ExecutionStart { source, .. } => source.raw_os_error(),
        }
    }
}

/// Failures of the wait/poll/signal primitives on a live record.
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("wait failed: {0}")]
    Wait(#[source] io::Error),
    #[error("cannot deliver signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: io::Error,
    },
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),
}

impl ProcessError {
    pub fn os_code(&self) -> Option<i32> {
        match self {
            ProcessError::Wait(source) | ProcessError::Signal { source, .. } => {
                source.raw_os_error()
            }
            ProcessError::InvalidSignal(_) => None,
        }
    }
}

/// Aggregate error for operations that spawn, talk to and wait on a child.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("pipe i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Spawn(e) => e.os_code(),
            Error::Process(e) => e.os_code(),
            Error::Io(e) => e.raw_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_sign_convention() {
        assert_eq!(ExitReason::exited(7).raw(), 7);
        assert_eq!(ExitReason::exited(7).code(), Some(7));
        assert_eq!(ExitReason::exited(7).signal(), None);

        let sig = ExitReason::signaled(2);
        assert_eq!(sig.raw(), -2);
        assert_eq!(sig.signal(), Some(2));
        assert_eq!(sig.code(), None);
        assert!(!sig.success());
        assert!(ExitReason::exited(0).success());
    }

    #[test]
    fn large_exit_codes_stay_normal_exits() {
        // An access violation on Windows exits with NTSTATUS 0xC0000005.
        let crash = ProcessState::Exited(0xC000_0005).exit_reason().unwrap();
        assert_eq!(crash.code(), Some(0xC000_0005));
        assert_eq!(crash.signal(), None);
        assert!(crash.raw() > 0);
        assert_eq!(crash.to_string(), "exit code 3221225477");

        let max = ExitReason::exited(u32::MAX);
        assert_eq!(max.code(), Some(u32::MAX));
        assert_eq!(max.signal(), None);
    }

    #[test]
    fn state_maps_to_exit_reason() {
        assert_eq!(ProcessState::Running.exit_reason(), None);
        assert_eq!(
            ProcessState::Exited(3).exit_reason(),
            Some(ExitReason::from_raw(3))
        );
        assert_eq!(
            ProcessState::Signaled(9).exit_reason(),
            Some(ExitReason::from_raw(-9))
        );
        assert_eq!(
            ProcessState::Stopped(19).exit_reason(),
            Some(ExitReason::from_raw(-19))
        );
        assert_eq!(
            ProcessState::Unknown.exit_reason(),
            Some(ExitReason::from_raw(1))
        );
        assert!(!ProcessState::Running.is_terminal());
        assert!(ProcessState::Unknown.is_terminal());
    }

    #[test]
    fn exit_reason_display() {
        assert_eq!(ExitReason::exited(0).to_string(), "exit code 0");
        assert_eq!(ExitReason::signaled(15).to_string(), "signal 15");
    }

    #[test]
    fn exit_reason_serializes_as_bare_integer() {
        let json = serde_json::to_string(&ExitReason::signaled(9)).unwrap();
        assert_eq!(json, "-9");
        let state = serde_json::to_string(&ProcessState::Exited(4)).unwrap();
        assert_eq!(state, r#"{"state":"exited","value":4}"#);
    }

    #[test]
    fn errors_expose_os_codes() {
        let e = SpawnError::ExecutionStart {
            program: "nope".into(),
            source: io::Error::from_raw_os_error(2),
        };
        assert_eq!(e.os_code(), Some(2));
        assert!(e.to_string().starts_with("cannot execute nope"));

        let e = SpawnError::configuration("no command or arguments specified");
        assert_eq!(e.os_code(), None);
        assert_eq!(
            e.to_string(),
            "invalid spawn request: no command or arguments specified"
        );

        let e: Error = ProcessError::Wait(io::Error::from_raw_os_error(10)).into();
        assert_eq!(e.os_code(), Some(10));
    }

    #[test]
    fn slots_are_ordered_by_descriptor_number() {
        let idx: Vec<usize> = Slot::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert_eq!(Slot::Stderr.to_string(), "stderr");
    }
}
