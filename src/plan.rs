//! Descriptor plan resolution: turns the three [`StreamRedirection`]s of a
//! request into owned OS descriptors for the child plus the parent ends of any
//! pipes. Everything is held in owning types, so an early return on any slot
//! closes whatever earlier slots already produced.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use subspawn_core::{Slot, SpawnError};
use tracing::debug;

use crate::pipe::PipeEndpoint;
use crate::request::{SpawnRequest, StreamRedirection};
use crate::sys::{self, OwnedStdio};

/// Descriptors to install at 0, 1, 2 in the child. `None` leaves the slot as
/// the child inherits it.
#[derive(Debug, Default)]
pub(crate) struct ChildStdio {
    pub stdin: Option<OwnedStdio>,
    pub stdout: Option<OwnedStdio>,
    pub stderr: Option<OwnedStdio>,
}

impl ChildStdio {
    fn set(&mut self, slot: Slot, fd: Option<OwnedStdio>) {
        match slot {
            Slot::Stdin => self.stdin = fd,
            Slot::Stdout => self.stdout = fd,
            Slot::Stderr => self.stderr = fd,
        }
    }
}

/// Parent ends of the pipes created for `Pipe` slots.
#[derive(Debug, Default)]
pub(crate) struct ParentPipes {
    pub stdin: Option<PipeEndpoint>,
    pub stdout: Option<PipeEndpoint>,
    pub stderr: Option<PipeEndpoint>,
}

impl ParentPipes {
    fn set(&mut self, slot: Slot, end: Option<PipeEndpoint>) {
        match slot {
            Slot::Stdin => self.stdin = end,
            Slot::Stdout => self.stdout = end,
            Slot::Stderr => self.stderr = end,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StdioPlan {
    pub child: ChildStdio,
    pub parent: ParentPipes,
}

fn open_for(slot: Slot, path: &Path) -> io::Result<File> {
    match slot {
        Slot::Stdin => File::open(path),
        Slot::Stdout | Slot::Stderr => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path),
    }
}

fn resolve_slot(
    slot: Slot,
    redirection: &StreamRedirection<'_>,
    resolved: &ChildStdio,
) -> Result<(Option<OwnedStdio>, Option<PipeEndpoint>), SpawnError> {
    match redirection {
        StreamRedirection::Inherit => {
            let fd = sys::dup_std(slot)
                .map_err(|e| SpawnError::resource(format!("duplicate parent {slot}"), e))?;
            Ok((fd, None))
        }
        StreamRedirection::File(path) => {
            let fd = open_for(slot, path)
                .and_then(sys::from_file)
                .map_err(|e| {
                    SpawnError::resource(format!("cannot open {} for {slot}", path.display()), e)
                })?;
            Ok((Some(fd), None))
        }
        StreamRedirection::Descriptor(raw) => {
            let fd = sys::dup_raw(*raw)
                .map_err(|e| SpawnError::resource(format!("duplicate descriptor for {slot}"), e))?;
            Ok((Some(fd), None))
        }
        StreamRedirection::Stream(stream) => {
            let fd = sys::dup_borrowed(*stream)
                .map_err(|e| SpawnError::resource(format!("duplicate stream for {slot}"), e))?;
            Ok((Some(fd), None))
        }
        StreamRedirection::Pipe => {
            let (read, write) = sys::pipe()
                .map_err(|e| SpawnError::resource(format!("create pipe for {slot}"), e))?;
            match slot {
                Slot::Stdin => Ok((Some(read), Some(PipeEndpoint::writer(write)))),
                Slot::Stdout | Slot::Stderr => Ok((Some(write), Some(PipeEndpoint::reader(read)))),
            }
        }
        StreamRedirection::MergeToStdout => {
            let target = match (slot, resolved.stdout.as_ref()) {
                (Slot::Stderr, Some(stdout)) => stdout,
                _ => {
                    return Err(SpawnError::configuration(
                        "only stderr can be merged, and only into a resolved stdout",
                    ));
                }
            };
            let fd = sys::dup_borrowed(sys::borrow_stdio(target))
                .map_err(|e| SpawnError::resource("duplicate stdout for stderr", e))?;
            Ok((Some(fd), None))
        }
    }
}

/// Resolve stdin, stdout, then stderr (merging depends on stdout being done).
pub(crate) fn resolve(request: &SpawnRequest<'_>) -> Result<StdioPlan, SpawnError> {
    let mut child = ChildStdio::default();
    let mut parent = ParentPipes::default();
    for slot in Slot::ALL {
        let (fd, end) = resolve_slot(slot, request.redirection(slot), &child)?;
        child.set(slot, fd);
        parent.set(slot, end);
    }
    debug!(
        stdin = ?request.redirection(Slot::Stdin),
        stdout = ?request.redirection(Slot::Stdout),
        stderr = ?request.redirection(Slot::Stderr),
        "descriptor plan resolved"
    );
    Ok(StdioPlan { child, parent })
}
