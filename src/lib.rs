//! Spawn child processes with redirected standard streams, learn reliably
//! whether the program actually started, then poll, wait on and signal them.
//!
//! ```no_run
//! use subspawn::{SpawnRequest, StreamRedirection, spawn};
//! use std::io::Read;
//!
//! let mut child = spawn(SpawnRequest::new(["ls", "-l"]).stdout(StreamRedirection::Pipe))?;
//! let mut listing = String::new();
//! child.stdout.as_mut().unwrap().read_to_string(&mut listing)?;
//! println!("ls finished with {}", child.process.wait()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod call;
pub mod config;
pub mod logging;
pub mod pipe;
mod plan;
pub mod process;
pub mod request;
pub mod spawn;
mod sys;

#[cfg(unix)]
pub use call::wait_any;
pub use call::{Captured, call, call_capture};
pub use pipe::{Direction, PipeEndpoint};
pub use process::{OsProcess, Process};
pub use request::{SpawnRequest, StreamRedirection};
pub use spawn::{Spawned, spawn};
pub use subspawn_core::{Error, ExitReason, ProcessError, ProcessState, Slot, SpawnError};
