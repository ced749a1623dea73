//! Real-time state subscription over a websocket.
//!
//! The writer forwards the session's broadcaster channel; when the
//! broadcaster drops that channel (overflow), the socket is closed with
//! reason `resync` so the client reconnects and receives a fresh snapshot.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use galleryd_common::SessionId;
use tokio::sync::mpsc;

use super::AppContext;
use crate::state::{ClientMessage, MessageKind, StateMessage};

/// Close code sent when a slow subscriber was disconnected
const RESYNC_CLOSE_CODE: u16 = 4000;

pub fn ws_routes() -> Router<AppContext> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: AppContext) {
    let (mut sink, mut stream) = socket.split();
    let subscription = ctx.broadcaster.subscribe();
    let session = subscription.id;
    let mut updates = subscription.rx;
    let (control_tx, mut control_rx) = mpsc::channel::<StateMessage>(8);

    let writer = tokio::spawn(async move {
        let mut last_version = 0u64;
        loop {
            let message = tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => {
                        let frame = CloseFrame {
                            code: RESYNC_CLOSE_CODE,
                            reason: "resync".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                },
                control = control_rx.recv() => match control {
                    Some(control) => control,
                    None => break,
                },
            };
            if !deliverable(&message, &mut last_version) {
                continue;
            }
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(session = %session, "Failed to encode state message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(session = %session, "WebSocket error: {}", e);
                break;
            }
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => {
                if !handle_client_message(&ctx, session, message, &control_tx).await {
                    break;
                }
            }
            Err(e) => tracing::debug!(session = %session, "Ignoring client message: {}", e),
        }
    }

    ctx.broadcaster.unsubscribe(session);
    drop(control_tx);
    let _ = writer.await;
}

/// Returns `false` when the session is gone.
async fn handle_client_message(
    ctx: &AppContext,
    session: SessionId,
    message: ClientMessage,
    control: &mpsc::Sender<StateMessage>,
) -> bool {
    match message {
        ClientMessage::RequestState => ctx.broadcaster.resync(session),
        ClientMessage::Ping => control
            .send(StateMessage::pong(ctx.broadcaster.version()))
            .await
            .is_ok(),
        ClientMessage::Ack { version } => {
            ctx.broadcaster.acknowledge(session, version);
            true
        }
    }
}

/// Versioned messages below the last delivered version are stale. Snapshots
/// may repeat the current version; pongs are never filtered.
fn deliverable(message: &StateMessage, last_version: &mut u64) -> bool {
    match message.kind {
        MessageKind::Pong => true,
        MessageKind::State => {
            if message.version < *last_version {
                return false;
            }
            *last_version = message.version;
            true
        }
        _ => {
            if message.version <= *last_version && *last_version > 0 {
                return false;
            }
            *last_version = message.version;
            true
        }
    }
}
