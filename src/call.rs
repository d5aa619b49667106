//! One-shot helpers built on [`spawn`]: run to completion, optionally
//! collecting what the child printed.

use std::io::{self, Read};
use std::thread;

use serde::Serialize;
use subspawn_core::{Error, ExitReason};
use tracing::{debug, warn};

use crate::pipe::PipeEndpoint;
use crate::process::{OsProcess, Process};
use crate::request::{SpawnRequest, StreamRedirection};
use crate::spawn::spawn;

/// Spawn, drop any pipes the request asked for, and wait for the exit.
///
/// The child is waited for even when closing a pipe fails; that error is
/// reported afterwards.
pub fn call(request: SpawnRequest<'_>) -> Result<ExitReason, Error> {
    let mut child = spawn(request)?;
    let closed = child.close_pipes();
    let exit = child.process.wait()?;
    closed?;
    Ok(exit)
}

/// Pass `io` through, but on failure kill and reap the child first so no
/// zombie or orphan outlives the error.
fn settle<H: OsProcess, T>(process: &mut Process<H>, io: io::Result<T>) -> Result<T, Error> {
    match io {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(kill) = process.kill() {
                warn!(pid = process.id(), "abandoning {process} after I/O error: {kill}");
            }
            Err(e.into())
        }
    }
}

/// Output of [`call_capture`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Captured {
    pub exit: ExitReason,
    pub stdout: Vec<u8>,
    /// Only present when the request piped stderr separately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<u8>>,
}

impl Captured {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

fn drain(end: &mut PipeEndpoint) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    end.read_to_end(&mut buf)?;
    end.close()?;
    Ok(buf)
}

/// Run the request with stdout piped back, read it to EOF, then wait.
///
/// Stdout is always captured. A piped stderr is read concurrently so neither
/// pipe can fill up and stall the child.
pub fn call_capture(mut request: SpawnRequest<'_>) -> Result<Captured, Error> {
    request = request.stdout(StreamRedirection::Pipe);
    let mut child = spawn(request)?;
    if let Some(stdin) = child.stdin.as_mut() {
        let closed = stdin.close();
        settle(&mut child.process, closed)?;
    }

    let (stdout, stderr) = thread::scope(|s| {
        let errors = child
            .stderr
            .as_mut()
            .map(|end| s.spawn(move || drain(end)));
        let stdout = child.stdout.as_mut().map(drain).transpose();
        let stderr = errors
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(std::io::Error::other("stderr reader panicked")))
            })
            .transpose();
        (stdout, stderr)
    });
    let stdout = settle(&mut child.process, stdout)?.unwrap_or_default();
    let stderr = settle(&mut child.process, stderr)?;

    let exit = child.process.wait()?;
    debug!(%exit, bytes = stdout.len(), "captured output");
    Ok(Captured {
        exit,
        stdout,
        stderr,
    })
}

/// Wait for whichever child of this process exits next.
///
/// Any child qualifies, including ones a [`crate::Process`] record is
/// tracking; that record's own `wait` then fails with `ECHILD`.
///
/// Such a record never learns of the exit and keeps reporting
/// [`ProcessState::Running`](subspawn_core::ProcessState::Running). Once the
/// pid is collected the kernel may hand it to an unrelated process, so a later
/// `send_signal`, `terminate` or `kill` on that record can hit the wrong
/// process. Drop records whose pid `wait_any` returned.
#[cfg(unix)]
pub fn wait_any() -> Result<(u32, ExitReason), subspawn_core::ProcessError> {
    let (pid, state) = crate::sys::wait_any().map_err(subspawn_core::ProcessError::Wait)?;
    let reason = state.exit_reason().unwrap_or(ExitReason::exited(1));
    Ok((pid, reason))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn call_returns_the_exit_reason() {
        let reason = call(SpawnRequest::new(["sh", "-c", "exit 3"])).unwrap();
        assert_eq!(reason, ExitReason::exited(3));
    }

    #[test]
    fn call_closes_requested_pipes() {
        // cat would block forever if its stdin pipe stayed open.
        let reason = call(SpawnRequest::new(["cat"]).stdin(StreamRedirection::Pipe)).unwrap();
        assert!(reason.success());
    }

    #[test]
    fn call_reports_spawn_failures() {
        let err = call(SpawnRequest::new(["subspawn-no-such-program"])).unwrap_err();
        assert!(matches!(
            err,
            Error::Spawn(subspawn_core::SpawnError::ExecutionStart { .. })
        ));
        assert_eq!(err.os_code(), Some(nix::libc::ENOENT));
    }

    #[test]
    fn capture_collects_stdout() {
        let out = call_capture(SpawnRequest::new(["echo", "hello"])).unwrap();
        assert_eq!(out.stdout_str(), "hello\n");
        assert!(out.exit.success());
        assert_eq!(out.stderr, None);
    }

    #[test]
    fn capture_reads_both_streams_without_deadlock() {
        // More than a pipe buffer on stderr before anything on stdout.
        let script = "head -c 200000 /dev/zero >&2; echo done";
        let out = call_capture(
            SpawnRequest::new(["sh", "-c", script]).stderr(StreamRedirection::Pipe),
        )
        .unwrap();
        assert_eq!(out.stdout_str(), "done\n");
        assert_eq!(out.stderr.map(|e| e.len()), Some(200_000));
    }

    #[test]
    fn capture_keeps_nonzero_exit() {
        let dir = tempdir().unwrap();
        let out = call_capture(
            SpawnRequest::new(["sh", "-c", "pwd; exit 4"]).cwd(dir.path()),
        )
        .unwrap();
        assert_eq!(out.exit, ExitReason::exited(4));
        assert!(!out.stdout.is_empty());
    }

    /// Backend whose signals always land.
    #[derive(Default)]
    struct Killable {
        exit: Option<subspawn_core::ProcessState>,
    }

    impl OsProcess for Killable {
        fn id(&self) -> u32 {
            77
        }

        fn try_wait(&mut self) -> io::Result<Option<subspawn_core::ProcessState>> {
            Ok(self.exit)
        }

        fn wait(&mut self) -> io::Result<subspawn_core::ProcessState> {
            self.exit
                .ok_or_else(|| io::Error::from_raw_os_error(nix::libc::ECHILD))
        }

        fn send_signal(&mut self, signal: i32) -> Result<(), subspawn_core::ProcessError> {
            self.exit = Some(subspawn_core::ProcessState::Signaled(signal));
            Ok(())
        }

        fn reap_on_drop(&mut self) -> bool {
            true
        }
    }

    #[test]
    fn io_failure_kills_and_reaps_before_returning() {
        let mut process = Process::from_handle(Killable::default());
        let err = settle::<_, ()>(&mut process, Err(io::Error::from(io::ErrorKind::BrokenPipe)))
            .unwrap_err();
        assert!(matches!(&err, Error::Io(e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(process.is_done());
        assert_eq!(process.exit_reason(), Some(ExitReason::signaled(nix::libc::SIGKILL)));
    }

    #[test]
    fn io_success_leaves_the_child_alone() {
        let mut process = Process::from_handle(Killable {
            exit: Some(subspawn_core::ProcessState::Exited(0)),
            ..Killable::default()
        });
        assert_eq!(settle(&mut process, Ok(5)).unwrap(), 5);
        assert!(!process.is_done());
        assert_eq!(process.wait().unwrap(), ExitReason::exited(0));
    }

    #[test]
    fn call_waits_even_after_closing_pipes() {
        // The stdin pipe gets closed by call; the child must still be reaped
        // so the exit reason comes back rather than a leftover zombie.
        let reason = call(
            SpawnRequest::new(["sh", "-c", "cat; exit 6"])
                .stdin(StreamRedirection::Pipe)
                .stdout(StreamRedirection::Pipe),
        )
        .unwrap();
        assert_eq!(reason, ExitReason::exited(6));
    }

    #[test]
    fn captured_serializes_for_json_output() {
        let c = Captured {
            exit: ExitReason::signaled(9),
            stdout: b"x".to_vec(),
            stderr: None,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["exit"], -9);
        assert!(json.get("stderr").is_none());
    }
}
