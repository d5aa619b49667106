//! Platform backends. Both expose the same surface:
//!
//! - descriptor primitives used by the plan resolver (`pipe`, `dup_std`,
//!   `dup_raw`, `dup_borrowed`, `from_file`, `close`)
//! - `spawn`, which creates the child from a resolved plan
//! - `Child`, implementing [`crate::process::OsProcess`]
//! - `TERMINATE_SIGNAL` / `KILL_SIGNAL`

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::*;
