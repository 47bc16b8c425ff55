//! Pseudo-terminal process launcher.
//!
//! Provides:
//! - `spawn` - Start a program attached to a fresh PTY
//! - `PtyProcess` - Write, resize and terminate a running child
//! - Executable resolution for the language runtime

pub mod process;
pub mod runtime;

pub use process::{ExitStatus, PtyError, PtyEvent, PtyProcess, SpawnRequest, TerminalSize, spawn};
pub use runtime::{resolve_executable, resolve_executable_path};
