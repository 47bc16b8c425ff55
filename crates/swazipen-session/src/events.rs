//! Outbound session events, one stream per connection.

use swazipen_core::SessionId;
use swazipen_pty::ExitStatus;

/// Something the client needs to hear about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub id: SessionId,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// The process was spawned and registered.
    Created,
    /// Raw output chunk.
    Data(Vec<u8>),
    /// The process ended on its own.
    Exit(ExitStatus),
    /// An explicit kill completed.
    Killed,
    /// A non-fatal failure for this id.
    Error(String),
}

impl SessionEvent {
    #[must_use]
    pub const fn new(id: SessionId, kind: SessionEventKind) -> Self {
        Self { id, kind }
    }

    #[must_use]
    pub const fn created(id: SessionId) -> Self {
        Self::new(id, SessionEventKind::Created)
    }

    #[must_use]
    pub const fn data(id: SessionId, chunk: Vec<u8>) -> Self {
        Self::new(id, SessionEventKind::Data(chunk))
    }

    #[must_use]
    pub const fn exit(id: SessionId, status: ExitStatus) -> Self {
        Self::new(id, SessionEventKind::Exit(status))
    }

    #[must_use]
    pub const fn killed(id: SessionId) -> Self {
        Self::new(id, SessionEventKind::Killed)
    }

    #[must_use]
    pub fn error(id: SessionId, message: impl Into<String>) -> Self {
        Self::new(id, SessionEventKind::Error(message.into()))
    }
}
