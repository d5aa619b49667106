use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use nix::errno::Errno;
use nix::libc::{self, c_char, c_int};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid, fork};
use rustix::io::fcntl_dupfd_cloexec;
use subspawn_core::{ProcessError, ProcessState, Slot, SpawnError};
use subspawn_ipc::{ChannelReport, encode_errno, read_report};
use tracing::{debug, warn};

use crate::plan::ChildStdio;
use crate::process::OsProcess;
use crate::spawn::Launch;

pub type OwnedStdio = OwnedFd;
pub type RawStdio = RawFd;
pub type BorrowedStdio<'a> = BorrowedFd<'a>;

pub const TERMINATE_SIGNAL: i32 = libc::SIGTERM;
pub const KILL_SIGNAL: i32 = libc::SIGKILL;

pub fn borrow_stdio<S: AsFd + ?Sized>(s: &S) -> BorrowedFd<'_> {
    s.as_fd()
}

/// Keep planned descriptors clear of 0..=2 so the child's `dup2` sequence
/// never overwrites a descriptor it has yet to install.
fn above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() > 2 {
        return Ok(fd);
    }
    Ok(fcntl_dupfd_cloexec(&fd, 3)?)
}

/// Close-on-exec pipe, returned as (read end, write end).
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let (r, w) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)?;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let (r, w) = {
        use rustix::io::{FdFlags, fcntl_setfd};
        let (r, w) = rustix::pipe::pipe()?;
        fcntl_setfd(&r, FdFlags::CLOEXEC)?;
        fcntl_setfd(&w, FdFlags::CLOEXEC)?;
        (r, w)
    };

    Ok((above_stdio(r)?, above_stdio(w)?))
}

/// Duplicate the parent's own descriptor for `slot`; `None` if the parent
/// has that slot closed.
pub fn dup_std(slot: Slot) -> io::Result<Option<OwnedFd>> {
    // SAFETY: only used for the duration of the fcntl call below.
    let fd = unsafe { BorrowedFd::borrow_raw(slot.index() as RawFd) };
    match fcntl_dupfd_cloexec(fd, 3) {
        Ok(fd) => Ok(Some(fd)),
        Err(e) if e == rustix::io::Errno::BADF => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn dup_raw(raw: RawFd) -> io::Result<OwnedFd> {
    if raw < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // SAFETY: the caller vouches for `raw`; a stale number fails with EBADF.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    Ok(fcntl_dupfd_cloexec(fd, 3)?)
}

pub fn dup_borrowed(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    Ok(fcntl_dupfd_cloexec(fd, 3)?)
}

pub fn from_file(file: File) -> io::Result<OwnedFd> {
    above_stdio(file.into())
}

/// Close and report the error `close(2)` returns, unlike `Drop`.
pub fn close(fd: OwnedFd) -> io::Result<()> {
    nix::unistd::close(fd.into_raw_fd()).map_err(io::Error::from)
}

fn cstring(s: &OsStr, what: &str) -> Result<CString, SpawnError> {
    CString::new(s.as_bytes())
        .map_err(|_| SpawnError::configuration(format!("{what} contains a NUL byte: {s:?}")))
}

fn open_max() -> c_int {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if n <= 0 {
        1024
    } else {
        n.min(c_int::MAX as libc::c_long) as c_int
    }
}

/// Everything the forked child touches, prepared before `fork`.
struct ExecContext<'a> {
    program: &'a CString,
    argv: &'a [*const c_char],
    cwd: Option<&'a CString>,
    /// Descriptor to install at 0, 1, 2; negative leaves the slot as inherited.
    stdio: [RawFd; 3],
    close_fds: bool,
    channel: RawFd,
    open_max: c_int,
}

/// Write errno to the channel and leave without running any destructors.
unsafe fn report_and_exit(channel: RawFd) -> ! {
    let code = io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    unsafe { report_code_and_exit(channel, code) }
}

unsafe fn report_code_and_exit(channel: RawFd, code: c_int) -> ! {
    let bytes = encode_errno(code);
    unsafe {
        libc::write(channel, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(1)
    }
}

unsafe fn close_descriptors(keep: RawFd, open_max: c_int) {
    #[cfg(target_os = "linux")]
    unsafe {
        use nix::libc::c_uint;
        let low = keep <= 3
            || libc::syscall(libc::SYS_close_range, 3 as c_uint, (keep - 1) as c_uint, 0 as c_uint)
                == 0;
        let high = libc::syscall(
            libc::SYS_close_range,
            (keep + 1) as c_uint,
            c_uint::MAX,
            0 as c_uint,
        ) == 0;
        if low && high {
            return;
        }
    }
    for fd in 3..open_max {
        if fd != keep {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Runs in the forked child: async-signal-safe libc calls only.
unsafe fn exec_child(ctx: &ExecContext<'_>) -> ! {
    unsafe {
        // Ignored dispositions and the blocked mask both survive exec; Rust
        // binaries ignore SIGPIPE and the forking thread may block anything.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut unblocked: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblocked);
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &unblocked, ptr::null_mut());
        if rc != 0 {
            report_code_and_exit(ctx.channel, rc);
        }

        for (slot, &fd) in ctx.stdio.iter().enumerate() {
            if fd >= 0 && libc::dup2(fd, slot as c_int) < 0 {
                report_and_exit(ctx.channel);
            }
        }
        if ctx.close_fds {
            close_descriptors(ctx.channel, ctx.open_max);
        }
        if let Some(dir) = ctx.cwd {
            if libc::chdir(dir.as_ptr()) < 0 {
                report_and_exit(ctx.channel);
            }
        }
        libc::execvp(ctx.program.as_ptr(), ctx.argv.as_ptr());
        report_and_exit(ctx.channel)
    }
}

/// Blocking reap of a child known to be exiting.
fn reap(pid: Pid) {
    loop {
        match wait::waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(pid = pid.as_raw(), "reaping failed child: {e}");
                return;
            }
            Ok(_) => return,
        }
    }
}

pub fn spawn(launch: &Launch<'_>, stdio: ChildStdio) -> Result<Child, SpawnError> {
    let program = cstring(launch.program, "program")?;
    let args = launch
        .args
        .iter()
        .map(|a| cstring(a, "argument"))
        .collect::<Result<Vec<_>, _>>()?;
    let mut argv: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(ptr::null());
    let cwd = launch
        .cwd
        .map(|d| cstring(d.as_os_str(), "working directory"))
        .transpose()?;

    let (channel_rx, channel_tx) =
        pipe().map_err(|e| SpawnError::resource("create error channel", e))?;

    let raw = |fd: Option<&OwnedFd>| fd.map_or(-1, |fd| fd.as_raw_fd());
    let ctx = ExecContext {
        program: &program,
        argv: &argv,
        cwd: cwd.as_ref(),
        stdio: [
            raw(stdio.stdin.as_ref()),
            raw(stdio.stdout.as_ref()),
            raw(stdio.stderr.as_ref()),
        ],
        close_fds: launch.close_fds,
        channel: channel_tx.as_raw_fd(),
        open_max: open_max(),
    };

    // SAFETY: the child branch only runs `exec_child`, which restricts itself to
    // async-signal-safe calls on memory prepared above and never returns.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => unsafe { exec_child(&ctx) },
        Err(errno) => return Err(SpawnError::ProcessCreation(errno.into())),
    };

    // Child-side ends must be gone before reading, or EOF never arrives.
    drop(channel_tx);
    drop(stdio);

    match read_report(File::from(channel_rx)) {
        Ok(ChannelReport::Started) => Ok(Child { pid }),
        Ok(ChannelReport::Failed(code)) => {
            reap(pid);
            Err(SpawnError::ExecutionStart {
                program: launch.program.to_string_lossy().into_owned(),
                source: io::Error::from_raw_os_error(code),
            })
        }
        Err(e) => {
            // State of the child is unknown; make sure it is gone.
            let _ = signal::kill(pid, Signal::SIGKILL);
            reap(pid);
            Err(SpawnError::ProcessCreation(e))
        }
    }
}

pub(crate) fn decode_status(status: WaitStatus) -> ProcessState {
    match status {
        // Only the low 8 bits of an exit status survive waitpid.
        WaitStatus::Exited(_, code) => ProcessState::Exited((code & 0xff) as u32),
        WaitStatus::Signaled(_, sig, _) => ProcessState::Signaled(sig as i32),
        WaitStatus::Stopped(_, sig) => ProcessState::Stopped(sig as i32),
        _ => ProcessState::Unknown,
    }
}

/// Live child of this process, identified by pid.
#[derive(Debug)]
pub struct Child {
    pid: Pid,
}

impl OsProcess for Child {
    fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessState>> {
        loop {
            match wait::waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => return Ok(Some(decode_status(status))),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wait(&mut self) -> io::Result<ProcessState> {
        loop {
            match wait::waitpid(self.pid, None) {
                Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => continue,
                Ok(status) => return Ok(decode_status(status)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send_signal(&mut self, signal: i32) -> Result<(), ProcessError> {
        let sig = Signal::try_from(signal).map_err(|_| ProcessError::InvalidSignal(signal))?;
        signal::kill(self.pid, sig).map_err(|e| ProcessError::Signal {
            signal,
            source: e.into(),
        })
    }

    fn reap_on_drop(&mut self) -> bool {
        match wait::waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(_) => {
                debug!(pid = self.pid.as_raw(), "reaped on drop");
                true
            }
            // ECHILD: someone else already collected it.
            Err(_) => true,
        }
    }
}

/// Block until any child of this process changes state.
pub fn wait_any() -> io::Result<(u32, ProcessState)> {
    loop {
        match wait::wait() {
            Ok(status) => {
                let pid = status.pid().map_or(0, |p| p.as_raw() as u32);
                return Ok((pid, decode_status(status)));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
