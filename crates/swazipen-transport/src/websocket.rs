//! WebSocket transport for web terminals.
//!
//! One socket carries any number of sessions. The reader dispatches frames to
//! the connection's [`Connection`] one at a time; a single writer task
//! serializes everything that goes back to the client.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use swazipen_session::{Connection, CreateRequest, SessionEvent};
use tokio::sync::mpsc;

use crate::{
    AppState,
    protocol::{ClientMessage, ServerMessage, parse_frame},
};

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection = Connection::new(state.ctx.clone(), event_tx);
    tracing::info!("WebSocket connected");

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(event) = event_rx.recv() => ServerMessage::from(event),
                Some(reply) = reply_rx.recv() => reply,
                else => break,
            };
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = reply_tx.send(ServerMessage::error(None, "Binary frame is not UTF-8"));
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket error: {e}");
                break;
            }
        };

        match parse_frame(&text) {
            Ok(client_msg) => dispatch(&connection, client_msg, &reply_tx).await,
            Err(reply) => {
                tracing::warn!("Invalid client message");
                let _ = reply_tx.send(reply);
            }
        }
    }

    connection.close().await;
    send_task.abort();
    tracing::info!("WebSocket disconnected");
}

/// Apply one client message to the connection.
pub(crate) async fn dispatch(
    connection: &Connection,
    msg: ClientMessage,
    replies: &mpsc::UnboundedSender<ServerMessage>,
) {
    match msg {
        ClientMessage::Create { id, payload } => match CreateRequest::try_from(payload) {
            Ok(request) => {
                connection.create(id, request).await;
            }
            Err(e) => {
                tracing::warn!(id = ?id, "{e}");
                let _ = replies.send(ServerMessage::error(id, e.to_string()));
            }
        },
        ClientMessage::Input { id, payload } => {
            if connection.session(&id).is_none() {
                tracing::trace!(%id, "Dropping input for unknown session");
                return;
            }
            match payload.decode() {
                Ok(bytes) => connection.input(&id, &bytes),
                Err(e) => {
                    let _ = replies.send(ServerMessage::error(Some(id), format!("Invalid input data: {e}")));
                }
            }
        }
        ClientMessage::Resize { id, payload } => connection.resize(&id, payload.into()),
        ClientMessage::Kill { id } => connection.kill(&id).await,
        ClientMessage::Ping => {
            let _ = replies.send(ServerMessage::Pong);
        }
    }
}
