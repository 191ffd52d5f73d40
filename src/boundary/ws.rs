//! WebSocket subscription endpoint: upgrades a connection and forwards
//! one task's `EventBus` stream to the client as JSON frames, including
//! the snapshot-on-subscribe status and an explicit backpressure marker
//! when the subscriber falls behind (spec §4.8).
//!
//! Grounded in the ws handler shape of `Rapheal7-My-Agent`'s
//! `realtime_voice.rs`: a `WebSocketUpgrade` extractor handing off to a
//! socket-owning async function, `split` into sink/stream halves, and a
//! forwarding task per direction.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::events::recv_or_backpressure;

use super::AppState;

pub async fn subscribe(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| forward_events(socket, scheduler, task_id))
}

async fn forward_events(socket: WebSocket, scheduler: AppState, task_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (snapshot, mut rx) = scheduler.event_bus().subscribe(&task_id).await;

    if let Some(event) = snapshot {
        if send_event(&mut sink, &event).await.is_err() {
            return;
        }
    }

    // Drain (and discard) client frames so the socket's read half is
    // serviced; a close or ping/pong round-trip is all this endpoint
    // expects from the client, mirroring a push-only subscription.
    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    loop {
        match recv_or_backpressure(&mut rx).await {
            Some(event) => {
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }

    reader.abort();
    debug!(task_id, "event subscriber disconnected");
}

async fn send_event(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &crate::events::Event,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(text)).await
}
