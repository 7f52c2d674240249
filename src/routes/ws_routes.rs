use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::{ChatRequest, WsEvent, WsRequest};
use crate::routes::AppState;
use crate::service::chat_service::{ChatService, PendingReply};

/// GET `/ws/chat` — upgrades to a WebSocket for streaming chat.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.chat))
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Client sends JSON `{ "type": "send", ... }` or `{ "type": "regenerate", ... }`
/// - Server streams back:
///   1. `{ "type": "stream_start", "conversation_id": "...", "branch": "..." }`
///   2. `{ "type": "stream_chunk", "content": "..." }` (repeated)
///   3. `{ "type": "stream_end", "message_id": "...", "full_content": "...", "truncated": bool }`
///   or `{ "type": "error", "message": "..." }` on failure.
/// - `{ "type": "cancel" }` (or disconnecting) aborts the in-flight stream;
///   whatever was generated so far is still committed, flagged truncated.
async fn handle_socket(mut socket: WebSocket, svc: ChatService) {
    info!("WebSocket client connected");

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        let text = match &msg {
            WsMessage::Text(t) => t.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let request: WsRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error {
                    message: format!("Invalid request: {e}"),
                })
                .await;
                continue;
            }
        };

        // ── Prepare: resolve branch state, commit what must precede the stream ─
        let pending = match request {
            WsRequest::Send { conversation_id, message } => {
                svc.prepare_send(ChatRequest { conversation_id, message }).await
            }
            WsRequest::Regenerate { conversation_id, message_id } => {
                svc.prepare_regenerate(&conversation_id, &message_id).await
            }
            // Nothing in flight to cancel.
            WsRequest::Cancel => continue,
        };
        let pending = match pending {
            Ok(p) => p,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error { message: e.to_string() }).await;
                continue;
            }
        };

        run_stream(&mut socket, &svc, pending).await;
    }

    info!("WebSocket client disconnected");
}

/// Drives one generation stream: forwards fragments to the client while the
/// orchestrator buffers and finally commits the reply. Client cancel/close
/// trips the token; the commit still happens.
async fn run_stream(socket: &mut WebSocket, svc: &ChatService, pending: PendingReply) {
    send_event(socket, &WsEvent::StreamStart {
        conversation_id: pending.conversation_id.clone(),
        branch: pending.branch.name.clone(),
    })
    .await;

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let commit = {
        let svc = svc.clone();
        let pending = pending.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { svc.stream_reply(&pending, tx, cancel).await })
    };

    let mut client_open = true;
    loop {
        if client_open {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(content) => {
                        send_event(socket, &WsEvent::StreamChunk { content }).await;
                    }
                    None => break,
                },
                incoming = socket.recv() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<WsRequest>(&text) {
                            Ok(WsRequest::Cancel) => cancel.cancel(),
                            Ok(_) => {
                                send_event(socket, &WsEvent::Error {
                                    message: "a stream is already in progress".to_string(),
                                })
                                .await;
                            }
                            Err(_) => {}
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        cancel.cancel();
                        client_open = false;
                    }
                    Some(Ok(_)) => {}
                },
            }
        } else {
            // Client is gone; drain so the commit can finish.
            if rx.recv().await.is_none() {
                break;
            }
        }
    }

    match commit.await {
        Ok(Ok(message)) => {
            send_event(socket, &WsEvent::StreamEnd {
                message_id: message.id.clone(),
                full_content: message.content,
                truncated: message.truncated,
            })
            .await;
        }
        Ok(Err(e)) => {
            error!("Streaming reply failed: {e}");
            send_event(socket, &WsEvent::Error { message: e.to_string() }).await;
        }
        Err(e) => {
            error!("Streaming task panicked: {e}");
            send_event(socket, &WsEvent::Error {
                message: "Internal error during streaming".to_string(),
            })
            .await;
        }
    }
}

/// Helper: serialize a `WsEvent` and send it over the socket.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = socket.send(WsMessage::Text(json.into())).await;
    }
}
