//! Glue layer that exposes the system `cryptsetup` backend to the rest of the
//! cryptvol stack. The heavy lifting lives in `system`, while `command`,
//! `parse` and `scratch` cover shell integration details.

mod command;
mod parse;
mod scratch;
mod system;

pub use command::{CommandRunner, Output};
pub use system::{SystemContext, SystemCryptsetupBackend, DEFAULT_CRYPTSETUP_PATHS};
