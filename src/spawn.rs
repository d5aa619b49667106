use std::ffi::{OsStr, OsString};
use std::path::Path;

use subspawn_core::SpawnError;
use tracing::{debug, debug_span};

use crate::pipe::PipeEndpoint;
use crate::plan::{self, StdioPlan};
use crate::process::{OsProcess, Process};
use crate::request::SpawnRequest;
use crate::sys;

/// Validated, resolved inputs handed to the platform backend.
pub(crate) struct Launch<'a> {
    pub program: &'a OsStr,
    pub args: &'a [OsString],
    pub cwd: Option<&'a Path>,
    pub close_fds: bool,
}

/// A running child plus the parent ends of any pipes requested for it.
#[derive(Debug)]
pub struct Spawned {
    pub process: Process,
    pub stdin: Option<PipeEndpoint>,
    pub stdout: Option<PipeEndpoint>,
    pub stderr: Option<PipeEndpoint>,
}

impl Spawned {
    /// Close every parent pipe end still held.
    ///
    /// A failure does not stop the rest from being closed; the first one is
    /// returned.
    pub fn close_pipes(&mut self) -> std::io::Result<()> {
        let mut first = Ok(());
        for end in [&mut self.stdin, &mut self.stdout, &mut self.stderr]
            .into_iter()
            .flatten()
        {
            let closed = end.close();
            if first.is_ok() {
                first = closed;
            }
        }
        first
    }
}

/// Start the program described by `request`.
///
/// On error nothing is left behind: no child process, no open descriptor.
pub fn spawn(request: SpawnRequest<'_>) -> Result<Spawned, SpawnError> {
    request.validate()?;
    let program = request
        .get_program()
        .ok_or_else(|| SpawnError::configuration("no command or arguments specified"))?;
    let span = debug_span!("spawn", program = %program.to_string_lossy());
    let _enter = span.enter();

    let StdioPlan { child, parent } = plan::resolve(&request)?;
    let launch = Launch {
        program,
        args: request.get_args(),
        cwd: request.get_cwd(),
        close_fds: request.get_close_fds(),
    };
    let handle = sys::spawn(&launch, child)?;
    debug!(pid = handle.id(), "spawned");

    Ok(Spawned {
        process: Process::from_handle(handle),
        stdin: parent.stdin,
        stdout: parent.stdout,
        stderr: parent.stderr,
    })
}
