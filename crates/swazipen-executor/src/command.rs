//! Runtime command building.

use std::path::{Path, PathBuf};

use swazipen_core::RuntimeConfig;
use swazipen_pty::SpawnRequest;
use thiserror::Error;

/// Flag that starts the runtime as an interactive interpreter.
pub const REPL_FLAG: &str = "-i";

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Runtime command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Runtime command is empty after parsing")]
    EmptyCommand,
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Turn into a PTY spawn request running in `cwd`.
    #[must_use]
    pub fn into_spawn_request(self, cwd: impl Into<PathBuf>) -> SpawnRequest {
        let Self { program, args } = self;
        SpawnRequest::new(program, cwd).args(args)
    }
}

/// Builder for runtime invocations.
///
/// The base is a shell-style command line, so a configured runtime may carry
/// its own leading flags.
#[derive(Debug, Clone)]
pub struct RuntimeCommand {
    /// Base runtime command line.
    pub base: String,
}

impl RuntimeCommand {
    /// Create a new runtime command.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self { base: base.into() }
    }

    /// Command for the runtime configured in `config`.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.command.clone())
    }

    /// `<runtime> <source>` for one-shot execution.
    ///
    /// # Errors
    /// Returns error if the runtime command line is invalid.
    pub fn build_run(&self, source: &Path) -> Result<CommandParts, CommandBuildError> {
        self.build(&[source.to_string_lossy().into_owned()])
    }

    /// `<runtime> -i` for an interactive session.
    ///
    /// # Errors
    /// Returns error if the runtime command line is invalid.
    pub fn build_repl(&self) -> Result<CommandParts, CommandBuildError> {
        self.build(&[REPL_FLAG.to_string()])
    }

    fn build(&self, additional_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(additional_args.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    let parts =
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))?;
    if parts.is_empty() {
        return Err(CommandBuildError::EmptyCommand);
    }
    Ok(parts)
}
