//! Session orchestration for SwaziPen connections.
//!
//! Provides:
//! - `SessionRegistry` - Concurrency-safe id -> session map
//! - `Session` - One PTY process plus its scratch file
//! - `Connection` - Lifecycle controller for all sessions of one client

pub mod connection;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;

pub use connection::{Connection, CreateRequest};
pub use error::SessionError;
pub use events::{SessionEvent, SessionEventKind};
pub use registry::{RegistryClosed, RegistryEntry, SessionRegistry};
pub use session::Session;
