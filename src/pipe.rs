use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};

use tracing::trace;

use crate::request::StreamRedirection;
use crate::sys::{self, OwnedStdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Parent reads what the child writes (stdout/stderr pipes).
    Read,
    /// Parent writes what the child reads (stdin pipe).
    Write,
}

/// Parent-side end of a pipe created for a redirected stream.
///
/// The other end lives only in the child. `close` is idempotent; dropping an
/// open endpoint closes it too, but callers should close explicitly so they see
/// the error, if any.
#[derive(Debug)]
pub struct PipeEndpoint {
    file: Option<File>,
    direction: Direction,
}

impl PipeEndpoint {
    pub(crate) fn reader(end: OwnedStdio) -> Self {
        PipeEndpoint {
            file: Some(File::from(end)),
            direction: Direction::Read,
        }
    }

    pub(crate) fn writer(end: OwnedStdio) -> Self {
        PipeEndpoint {
            file: Some(File::from(end)),
            direction: Direction::Write,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Close the endpoint. Closing an already closed endpoint is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => sys::close(file.into()),
            None => Ok(()),
        }
    }

    /// Borrow this endpoint as the redirection of a later spawn.
    pub fn as_redirection(&self) -> io::Result<StreamRedirection<'_>> {
        let file = self.file.as_ref().ok_or_else(closed)?;
        Ok(StreamRedirection::Stream(sys::borrow_stdio(file)))
    }

    fn open_as(&mut self, want: Direction) -> io::Result<&mut File> {
        if self.direction != want {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{:?} end of a pipe used for {want:?}", self.direction),
            ));
        }
        self.file.as_mut().ok_or_else(closed)
    }
}

fn closed() -> io::Error {
    io::Error::new(ErrorKind::BrokenPipe, "pipe endpoint is closed")
}

impl Read for PipeEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.open_as(Direction::Read)?.read(buf)
    }
}

impl Write for PipeEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.open_as(Direction::Write)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match (&mut self.file, self.direction) {
            (Some(file), Direction::Write) => file.flush(),
            _ => Ok(()),
        }
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        if self.file.is_some() {
            trace!(direction = ?self.direction, "closing pipe endpoint on drop");
        }
    }
}
