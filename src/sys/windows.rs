//! Windows backend. There is no fork: `CreateProcessW` (through
//! `std::process::Command`) takes the prepared handles and reports load
//! failures synchronously, so no error channel is needed.

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::windows::io::{AsHandle, BorrowedHandle, OwnedHandle, RawHandle};
use std::process::{Command, ExitStatus, Stdio};

use subspawn_core::{ProcessError, ProcessState, Slot, SpawnError};
use tracing::debug;

use crate::plan::ChildStdio;
use crate::process::OsProcess;
use crate::spawn::Launch;

pub type OwnedStdio = OwnedHandle;
pub type RawStdio = RawHandle;
pub type BorrowedStdio<'a> = BorrowedHandle<'a>;

/// Nominal numbers; any signal terminates the process through its handle.
pub const TERMINATE_SIGNAL: i32 = 15;
pub const KILL_SIGNAL: i32 = 9;

const ERROR_BAD_EXE_FORMAT: i32 = 193;

pub fn borrow_stdio<S: AsHandle + ?Sized>(s: &S) -> BorrowedHandle<'_> {
    s.as_handle()
}

/// Anonymous pipe, returned as (read end, write end). Neither end is inheritable.
pub fn pipe() -> io::Result<(OwnedHandle, OwnedHandle)> {
    let (r, w) = io::pipe()?;
    Ok((r.into(), w.into()))
}

pub fn dup_std(slot: Slot) -> io::Result<Option<OwnedHandle>> {
    let dup = match slot {
        Slot::Stdin => io::stdin().as_handle().try_clone_to_owned(),
        Slot::Stdout => io::stdout().as_handle().try_clone_to_owned(),
        Slot::Stderr => io::stderr().as_handle().try_clone_to_owned(),
    };
    match dup {
        Ok(h) => Ok(Some(h)),
        // Detached processes have no console handles to hand down.
        Err(e) => {
            debug!(%slot, "parent has no usable handle: {e}");
            Ok(None)
        }
    }
}

pub fn dup_raw(raw: RawHandle) -> io::Result<OwnedHandle> {
    if raw.is_null() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "null handle"));
    }
    // SAFETY: the caller vouches for `raw`; DuplicateHandle rejects stale values.
    unsafe { BorrowedHandle::borrow_raw(raw) }.try_clone_to_owned()
}

pub fn dup_borrowed(h: BorrowedHandle<'_>) -> io::Result<OwnedHandle> {
    h.try_clone_to_owned()
}

pub fn from_file(file: File) -> io::Result<OwnedHandle> {
    Ok(file.into())
}

pub fn close(h: OwnedHandle) -> io::Result<()> {
    drop(h);
    Ok(())
}

fn into_stdio(h: Option<OwnedHandle>) -> Stdio {
    h.map_or_else(Stdio::inherit, Stdio::from)
}

/// Errors meaning the process object may exist but the image could not be
/// loaded, as opposed to the OS refusing to create a process.
fn is_load_failure(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied)
        || e.raw_os_error() == Some(ERROR_BAD_EXE_FORMAT)
}

pub fn spawn(launch: &Launch<'_>, stdio: ChildStdio) -> Result<Child, SpawnError> {
    // The command line is rebuilt from the program; args[0] cannot be set apart.
    let mut cmd = Command::new(launch.program);
    cmd.args(launch.args.iter().skip(1));
    if let Some(dir) = launch.cwd {
        cmd.current_dir(dir);
    }
    if launch.close_fds {
        // CreateProcessW runs with bInheritHandles = TRUE; only handles made
        // here are guaranteed non-inheritable.
        debug!("close_fds does not revoke inheritable handles created by the caller");
    }
    let ChildStdio {
        stdin,
        stdout,
        stderr,
    } = stdio;
    cmd.stdin(into_stdio(stdin))
        .stdout(into_stdio(stdout))
        .stderr(into_stdio(stderr));

    match cmd.spawn() {
        Ok(inner) => Ok(Child {
            inner,
            requested: None,
        }),
        Err(e) if is_load_failure(&e) => Err(SpawnError::ExecutionStart {
            program: launch.program.to_string_lossy().into_owned(),
            source: e,
        }),
        Err(e) => Err(SpawnError::ProcessCreation(e)),
    }
}

#[derive(Debug)]
pub struct Child {
    inner: std::process::Child,
    /// Signal number requested through `send_signal`, reported as `-signal`.
    requested: Option<i32>,
}

/// Windows exit codes are `u32`; NTSTATUS crash codes such as `0xC0000005`
/// must not read as negative (signal) exit reasons.
fn decode_status(status: ExitStatus, requested: Option<i32>) -> ProcessState {
    match requested {
        Some(sig) => ProcessState::Signaled(sig),
        None => ProcessState::Exited(status.code().map_or(1, |code| code as u32)),
    }
}

impl OsProcess for Child {
    fn id(&self) -> u32 {
        self.inner.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessState>> {
        Ok(self
            .inner
            .try_wait()?
            .map(|s| decode_status(s, self.requested)))
    }

    fn wait(&mut self) -> io::Result<ProcessState> {
        let status = self.inner.wait()?;
        Ok(decode_status(status, self.requested))
    }

    fn send_signal(&mut self, signal: i32) -> Result<(), ProcessError> {
        if signal <= 0 {
            return Err(ProcessError::InvalidSignal(signal));
        }
        let running = self
            .inner
            .try_wait()
            .map_err(|source| ProcessError::Signal { signal, source })?
            .is_none();
        if running {
            self.inner
                .kill()
                .map_err(|source| ProcessError::Signal { signal, source })?;
            self.requested = Some(signal);
        }
        Ok(())
    }

    fn reap_on_drop(&mut self) -> bool {
        // No zombies: the process object goes away with its last handle.
        true
    }
}
