//! WebSocket surface for the event relay.
//!
//! Clients send `{"action":"subscribe","correlationId":"..."}` (or
//! `unsubscribe`) as JSON text frames and receive relay events as JSON text
//! frames. One socket can follow any number of correlation ids; everything
//! is detached when the socket closes.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::relay::SubscriptionHandle;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientCommand {
    action: String,
    correlation_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandAck {
    status: String,
    correlation_id: Uuid,
    message: String,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();

    // All outbound frames funnel through one channel so the relay forward
    // tasks and command acks never contend for the sink.
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let write_task = tokio::spawn(write_loop(sink, out_rx));

    read_loop(stream, &state, out_tx).await;

    write_task.abort();
    debug!("WebSocket session closed");
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = rx.recv().await {
        if sink.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    out_tx: mpsc::UnboundedSender<String>,
) {
    let mut subscriptions: HashMap<Uuid, (SubscriptionHandle, tokio::task::JoinHandle<()>)> =
        HashMap::new();

    while let Some(received) = stream.next().await {
        let msg = match received {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "WebSocket read failed");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                handle_command(&text, state, &out_tx, &mut subscriptions);
            }
            Message::Close(_) => break,
            // Pings are answered by axum automatically.
            _ => {}
        }
    }

    for (_, (handle, task)) in subscriptions {
        task.abort();
        state.relay.unsubscribe(&handle);
    }
}

fn handle_command(
    text: &str,
    state: &AppState,
    out_tx: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashMap<Uuid, (SubscriptionHandle, tokio::task::JoinHandle<()>)>,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(error = %e, "Unparseable client frame, ignored");
            return;
        }
    };
    let id = command.correlation_id;

    let ack = match command.action.as_str() {
        "subscribe" => {
            if subscriptions.contains_key(&id) {
                CommandAck {
                    status: "error".to_string(),
                    correlation_id: id,
                    message: "already subscribed".to_string(),
                }
            } else {
                let (handle, mut events) = state.relay.subscribe(id);
                info!(correlation_id = %id, "WebSocket observer attached");

                let tx = out_tx.clone();
                let forward = tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let Ok(frame) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                });
                subscriptions.insert(id, (handle, forward));

                CommandAck {
                    status: "subscribed".to_string(),
                    correlation_id: id,
                    message: "observer attached".to_string(),
                }
            }
        }
        "unsubscribe" => match subscriptions.remove(&id) {
            Some((handle, task)) => {
                task.abort();
                state.relay.unsubscribe(&handle);
                CommandAck {
                    status: "unsubscribed".to_string(),
                    correlation_id: id,
                    message: "observer detached".to_string(),
                }
            }
            None => CommandAck {
                status: "error".to_string(),
                correlation_id: id,
                message: "not subscribed".to_string(),
            },
        },
        other => {
            warn!(action = other, "Unknown WebSocket action");
            CommandAck {
                status: "error".to_string(),
                correlation_id: id,
                message: format!("unknown action: {other}"),
            }
        }
    };

    if let Ok(frame) = serde_json::to_string(&ack) {
        let _ = out_tx.send(frame);
    }
}
