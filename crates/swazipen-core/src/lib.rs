//! Core vocabulary for SwaziPen process sessions.
//!
//! This crate provides the types every layer agrees on:
//! - `SessionId` / `SessionMode` - Session addressing and kind
//! - `ProjectContext` - Project root and runtime configuration
//! - `RunPolicy` - How RUN sessions pick the file to execute

pub mod context;
pub mod session;

pub use context::{ContextError, ProjectContext, RunPolicy, RuntimeConfig};
pub use session::{SessionId, SessionMode, SessionState};
