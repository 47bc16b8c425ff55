//! Transport layer for web terminals.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - WebSocket transport (feature: websocket)
//! - `POST /api/execute` bounded runs (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod http;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ClientMessage, ServerMessage};

#[cfg(feature = "websocket")]
pub use app::{AppState, router};

#[cfg(feature = "websocket")]
mod app {
    use std::sync::Arc;

    use axum::{
        Router,
        routing::{get, post},
    };
    use swazipen_core::ProjectContext;
    use tower_http::trace::TraceLayer;

    use crate::{http::execute_handler, websocket::ws_handler};

    /// State shared by every handler.
    #[derive(Clone)]
    pub struct AppState {
        pub ctx: Arc<ProjectContext>,
    }

    impl AppState {
        #[must_use]
        pub const fn new(ctx: Arc<ProjectContext>) -> Self {
            Self { ctx }
        }
    }

    /// Routes for `/ws` and `/api/execute`.
    #[must_use]
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/execute", post(execute_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}
