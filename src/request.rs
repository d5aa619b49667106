use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use subspawn_core::{Slot, SpawnError};

use crate::sys::{self, BorrowedStdio, RawStdio};

/// What to connect one of the child's standard streams to.
#[derive(Debug, Default)]
pub enum StreamRedirection<'a> {
    /// Give the child a duplicate of the parent's own stream.
    #[default]
    Inherit,
    /// Open a file: read-only for stdin, created/truncated for stdout and stderr.
    File(PathBuf),
    /// Duplicate a raw descriptor (a `HANDLE` on Windows) owned by the caller.
    Descriptor(RawStdio),
    /// Duplicate an open stream, e.g. a [`crate::PipeEndpoint`] from an earlier spawn.
    Stream(BorrowedStdio<'a>),
    /// Create a new pipe; the parent end is returned from [`crate::spawn`].
    Pipe,
    /// Send stderr wherever stdout goes. Only valid for stderr when stdout is `Pipe`.
    MergeToStdout,
}

impl<'a> StreamRedirection<'a> {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        StreamRedirection::File(path.into())
    }

    #[cfg(unix)]
    pub fn stream<S: std::os::fd::AsFd + ?Sized>(s: &'a S) -> Self {
        StreamRedirection::Stream(sys::borrow_stdio(s))
    }

    #[cfg(windows)]
    pub fn stream<S: std::os::windows::io::AsHandle + ?Sized>(s: &'a S) -> Self {
        StreamRedirection::Stream(sys::borrow_stdio(s))
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, StreamRedirection::Pipe)
    }
}

/// Everything needed to start one child. Consumed by [`crate::spawn`].
#[derive(Debug, Default)]
pub struct SpawnRequest<'a> {
    args: Vec<OsString>,
    executable: Option<OsString>,
    cwd: Option<PathBuf>,
    close_fds: bool,
    stdin: StreamRedirection<'a>,
    stdout: StreamRedirection<'a>,
    stderr: StreamRedirection<'a>,
}

impl<'a> SpawnRequest<'a> {
    /// `args[0]` names the program unless [`SpawnRequest::executable`] overrides it.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        SpawnRequest {
            args: args.into_iter().map(|a| a.as_ref().to_owned()).collect(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Load this program instead of `args[0]`; `args[0]` is still passed as argv[0].
    pub fn executable(mut self, program: impl AsRef<OsStr>) -> Self {
        self.executable = Some(program.as_ref().to_owned());
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Close every descriptor other than 0, 1 and 2 in the child.
    pub fn close_fds(mut self, close: bool) -> Self {
        self.close_fds = close;
        self
    }

    pub fn stdin(mut self, r: StreamRedirection<'a>) -> Self {
        self.stdin = r;
        self
    }

    pub fn stdout(mut self, r: StreamRedirection<'a>) -> Self {
        self.stdout = r;
        self
    }

    pub fn stderr(mut self, r: StreamRedirection<'a>) -> Self {
        self.stderr = r;
        self
    }

    pub fn set_redirection(&mut self, slot: Slot, r: StreamRedirection<'a>) {
        match slot {
            Slot::Stdin => self.stdin = r,
            Slot::Stdout => self.stdout = r,
            Slot::Stderr => self.stderr = r,
        }
    }

    pub fn redirection(&self, slot: Slot) -> &StreamRedirection<'a> {
        match slot {
            Slot::Stdin => &self.stdin,
            Slot::Stdout => &self.stdout,
            Slot::Stderr => &self.stderr,
        }
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Program that will be loaded: the override, else `args[0]`.
    pub fn get_program(&self) -> Option<&OsStr> {
        self.executable
            .as_deref()
            .or_else(|| self.args.first().map(OsString::as_os_str))
    }

    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_close_fds(&self) -> bool {
        self.close_fds
    }

    /// Reject malformed requests before any OS resource is allocated.
    pub fn validate(&self) -> Result<(), SpawnError> {
        if self.args.is_empty() {
            return Err(SpawnError::configuration(
                "no command or arguments specified",
            ));
        }
        for a in self.args.iter().chain(self.executable.iter()) {
            if a.as_encoded_bytes().contains(&0) {
                return Err(SpawnError::configuration(format!(
                    "argument contains a NUL byte: {a:?}"
                )));
            }
        }
        if let Some(dir) = &self.cwd {
            let meta = fs::metadata(dir).map_err(|e| {
                SpawnError::configuration(format!("cannot chdir to {}: {e}", dir.display()))
            })?;
            if !meta.is_dir() {
                return Err(SpawnError::configuration(format!(
                    "cannot chdir to {}: not a directory",
                    dir.display()
                )));
            }
        }
        for slot in [Slot::Stdin, Slot::Stdout] {
            if matches!(self.redirection(slot), StreamRedirection::MergeToStdout) {
                return Err(SpawnError::configuration(format!(
                    "{slot} cannot be merged into stdout"
                )));
            }
        }
        if matches!(self.stderr, StreamRedirection::MergeToStdout) && !self.stdout.is_pipe() {
            return Err(SpawnError::configuration(
                "stderr can only be merged into stdout when stdout is a pipe",
            ));
        }
        Ok(())
    }
}
