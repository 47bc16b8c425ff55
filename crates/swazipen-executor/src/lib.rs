//! Runtime invocation for SwaziPen.
//!
//! Provides:
//! - `RuntimeCommand` - Build `<runtime> <file>` and `<runtime> -i` invocations
//! - Scratch-file provisioning for RUN executions
//! - `run_bounded` - Timeout-bounded batch execution

pub mod batch;
pub mod command;
pub mod scratch;

pub use batch::{BatchError, BatchOutcome, BatchRequest, TIMEOUT_NOTE, run_bounded};
pub use command::{CommandBuildError, CommandParts, REPL_FLAG, RuntimeCommand};
pub use scratch::{DEFAULT_RUN_FILENAME, RunTarget, ScratchError, ScratchFile, prepare_run_target};
