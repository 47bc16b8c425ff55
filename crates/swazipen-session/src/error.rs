//! Session error type.

use swazipen_executor::{CommandBuildError, ScratchError};
use swazipen_pty::PtyError;
use thiserror::Error;

/// Failure scoped to a single session id.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Command(#[from] CommandBuildError),
    #[error(transparent)]
    Scratch(#[from] ScratchError),
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error("Connection is closed")]
    ConnectionClosed,
}
