//! Session addressing and lifecycle vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque routing key of a session, unique within one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Server-generated id: `term-` followed by 12 hex characters.
    #[must_use]
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("term-{}", &hex[..12]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One-shot execution of a source snapshot; expected to terminate.
    Run,
    /// Long-lived interactive interpreter.
    #[default]
    Repl,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => f.write_str("run"),
            Self::Repl => f.write_str("repl"),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Resources are being provisioned; not yet registered.
    Creating,
    /// Process is live and registered.
    Running,
    /// Teardown in progress.
    Exiting,
    /// Terminal; the id may be reused.
    Gone,
}

impl SessionState {
    /// Whether the session still owns a process.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Creating | Self::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert!(a.as_str().starts_with("term-"));
        assert_eq!(a.as_str().len(), "term-".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = SessionId::from("r1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"r1\"");
        assert_eq!(id.to_string(), "r1");
    }

    #[test]
    fn test_mode_wire_names() {
        assert_eq!(serde_json::to_string(&SessionMode::Run).unwrap(), "\"run\"");
        let mode: SessionMode = serde_json::from_str("\"repl\"").unwrap();
        assert_eq!(mode, SessionMode::Repl);
        assert_eq!(SessionMode::default(), SessionMode::Repl);
        assert!(serde_json::from_str::<SessionMode>("\"debug\"").is_err());
    }

    #[test]
    fn test_state_liveness() {
        assert!(SessionState::Running.is_live());
        assert!(!SessionState::Exiting.is_live());
        assert!(!SessionState::Gone.is_live());
    }
}
