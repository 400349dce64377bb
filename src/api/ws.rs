// Realtime channel - a single bidirectional WebSocket per session, carrying
// admin registrations, display heartbeats, state deltas, and commands.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::hub::{ClientMessage, ServerMessage};
use crate::services::displays;
use crate::AppState;

/// GET /ws - upgrade to the realtime channel
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum Registration {
    Admin { session_id: u64 },
    Display { code: String, session_id: u64 },
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let mut sender = Some(sender);
    let mut registration: Option<Registration> = None;

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Binary(_)) => {
                continue;
            }
            Err(e) => {
                tracing::debug!("WebSocket receive error: {}", e);
                break;
            }
        };

        let parsed: ClientMessage = match serde_json::from_str(&message) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("Ignoring malformed realtime message: {}", e);
                continue;
            }
        };

        match parsed {
            ClientMessage::RegisterAdmin { admin_id, displays } => {
                if registration.is_some() {
                    tracing::debug!("Session already registered; ignoring registerAdmin");
                    continue;
                }
                let (session_id, rx) = state.hub.register_admin(&admin_id, displays).await;
                if let Some(sender) = sender.take() {
                    spawn_forwarder(rx, sender);
                }
                registration = Some(Registration::Admin { session_id });
            }
            ClientMessage::RegisterDisplay { code } => {
                if registration.is_some() {
                    tracing::debug!("Session already registered; ignoring registerDisplay");
                    continue;
                }
                if displays::get_display(&state.pool, &code).await.is_err() {
                    tracing::warn!("Unknown display {} tried to register", code);
                    break;
                }
                let (session_id, rx) = state.hub.register_display(&code).await;
                if let Some(sender) = sender.take() {
                    spawn_forwarder(rx, sender);
                }
                tracing::info!("Display {} connected (session {})", code, session_id);
                registration = Some(Registration::Display { code, session_id });
            }
            ClientMessage::Heartbeat {
                code,
                video_progress,
            } => match state.playback.heartbeat(&code, video_progress).await {
                Ok(delta) => {
                    // An offline display coming back is announced right away
                    let previous = state.hub.note_liveness(&code, true).await;
                    if previous != Some(true) {
                        state.hub.broadcast_display_status(&code, true).await;
                    }
                    state.hub.broadcast(&delta).await;
                }
                Err(e) => tracing::warn!("Heartbeat for {} failed: {}", code, e),
            },
            ClientMessage::VideoEnded { code } => {
                match state.playback.video_ended(&code).await {
                    Ok(delta) => state.hub.broadcast(&delta).await,
                    Err(e) => tracing::warn!("videoEnded for {} failed: {}", code, e),
                }
            }
        }
    }

    match registration {
        Some(Registration::Admin { session_id }) => {
            state.hub.unregister_admin(session_id).await;
        }
        Some(Registration::Display { code, session_id }) => {
            state.hub.unregister_display(&code, session_id).await;
            tracing::info!("Display {} disconnected (session {})", code, session_id);
        }
        None => {}
    }
}

/// Forward hub messages to the socket until either side closes.
fn spawn_forwarder(
    mut rx: UnboundedReceiver<ServerMessage>,
    mut sender: SplitSink<WebSocket, WsMessage>,
) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode realtime message: {}", e);
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });
}
