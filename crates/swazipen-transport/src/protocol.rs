//! Wire protocol for client-server communication.
//!
//! Every frame is a JSON object `{ "type", "id", "payload" }`. Byte payloads
//! are base64 so output split inside a UTF-8 sequence survives the trip.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use swazipen_core::{SessionId, SessionMode};
use swazipen_pty::{ExitStatus, TerminalSize};
use swazipen_session::{CreateRequest, SessionEvent, SessionEventKind};
use thiserror::Error;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a session; the server picks an id when none is given.
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<SessionId>,
        #[serde(default)]
        payload: CreatePayload,
    },
    /// Terminal input (base64).
    Input { id: SessionId, payload: DataPayload },
    Resize { id: SessionId, payload: ResizePayload },
    Kill { id: SessionId },
    /// Keepalive.
    Ping,
}

/// Mode as sent by the client. Unknown names are kept so the error can be
/// scoped to the requested id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestedMode {
    Known(SessionMode),
    Unsupported(String),
}

impl Default for RequestedMode {
    fn default() -> Self {
        Self::Known(SessionMode::default())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unsupported terminal mode: {0}")]
pub struct UnsupportedMode(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayload {
    #[serde(default)]
    pub mode: RequestedMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, alias = "code", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl TryFrom<CreatePayload> for CreateRequest {
    type Error = UnsupportedMode;

    fn try_from(payload: CreatePayload) -> Result<Self, Self::Error> {
        let mode = match payload.mode {
            RequestedMode::Known(mode) => mode,
            RequestedMode::Unsupported(name) => return Err(UnsupportedMode(name)),
        };
        let fallback = TerminalSize::default();
        Ok(Self {
            mode,
            size: TerminalSize::new(
                payload.cols.unwrap_or(fallback.cols),
                payload.rows.unwrap_or(fallback.rows),
            ),
            source: payload.source,
            filename: payload.filename,
        })
    }
}

/// Raw bytes, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    pub data: String,
}

impl DataPayload {
    #[must_use]
    pub fn encode(bytes: &[u8]) -> Self {
        Self {
            data: BASE64.encode(bytes),
        }
    }

    /// # Errors
    /// Returns error if `data` is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

impl From<ResizePayload> for TerminalSize {
    fn from(payload: ResizePayload) -> Self {
        Self::new(payload.cols, payload.rows)
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Created { id: SessionId },
    /// Terminal output (base64).
    Data { id: SessionId, payload: DataPayload },
    /// Natural termination.
    Exit { id: SessionId, payload: ExitPayload },
    Killed { id: SessionId },
    /// Non-fatal failure. No id when the offending frame could not be parsed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<SessionId>,
        payload: ErrorPayload,
    },
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPayload {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

impl From<ExitStatus> for ExitPayload {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code,
            signal: status.signal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ServerMessage {
    #[must_use]
    pub fn error(id: Option<SessionId>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            payload: ErrorPayload {
                message: message.into(),
            },
        }
    }

    /// Decode output data from base64.
    #[must_use]
    pub fn decode_output(&self) -> Option<Vec<u8>> {
        if let Self::Data { payload, .. } = self {
            payload.decode().ok()
        } else {
            None
        }
    }
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        let SessionEvent { id, kind } = event;
        match kind {
            SessionEventKind::Created => Self::Created { id },
            SessionEventKind::Data(chunk) => Self::Data {
                id,
                payload: DataPayload::encode(&chunk),
            },
            SessionEventKind::Exit(status) => Self::Exit {
                id,
                payload: status.into(),
            },
            SessionEventKind::Killed => Self::Killed { id },
            SessionEventKind::Error(message) => Self::error(Some(id), message),
        }
    }
}

/// Parse one text frame, or produce the id-less error to send back.
///
/// # Errors
/// Returns the error reply when the frame is not a valid client message.
pub fn parse_frame(text: &str) -> Result<ClientMessage, ServerMessage> {
    serde_json::from_str(text)
        .map_err(|e| ServerMessage::error(None, format!("Invalid message: {e}")))
}
