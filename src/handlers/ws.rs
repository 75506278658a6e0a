//! WebSocket streaming endpoint.
//!
//! One socket per conversation. On connect the client receives a resume
//! frame describing the latest session (attach / replay / terminal / idle),
//! then live events as they are published. The client can send `subscribe`
//! and `cancel` frames; everything else is ignored.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, warn};

use crate::api::ClientFrame;
use crate::server::AppState;

/// GET /api/conversations/{conversation_id}/ws
pub async fn conversation_stream(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, conversation_id, socket))
}

async fn handle_socket(state: AppState, conversation_id: String, socket: WebSocket) {
    // Subscribe before computing the resume snapshot so no event published
    // in between can be missed.
    let mut subscription = state.hub.subscribe(&conversation_id);

    let resume = match state.hub.resume(&conversation_id) {
        Ok(resume) => resume,
        Err(e) => {
            error!(conversation_id = %conversation_id, error = %e, "resume failed");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    let resume_json = match serde_json::to_string(&resume) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "failed to serialize resume frame");
            return;
        }
    };
    if sender.send(Message::Text(resume_json.into())).await.is_err() {
        return;
    }

    debug!(conversation_id = %conversation_id, "websocket subscriber attached");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize event, skipping");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&state, &conversation_id, text.as_str());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conversation_id = %conversation_id, error = %e, "websocket read error");
                    break;
                }
            }
        }
    }

    debug!(conversation_id = %conversation_id, "websocket subscriber detached");
}

fn handle_client_frame(state: &AppState, conversation_id: &str, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "ignoring malformed client frame");
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe {
            conversation_id: requested,
        } => {
            // The socket is already keyed by its path; a mismatched id is a
            // client bug worth logging.
            if requested != conversation_id {
                warn!(
                    socket_conversation = %conversation_id,
                    requested = %requested,
                    "subscribe frame for a different conversation"
                );
            }
        }
        ClientFrame::Cancel { session_id } => {
            if let Err(e) = state.dispatcher.cancel(&session_id) {
                warn!(session_id = %session_id, error = %e, "cancel failed");
            }
        }
    }
}
