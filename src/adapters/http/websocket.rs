use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::AppState;
use crate::domain::models::{ClientCommand, ProgressMessage};

/// GET /runs/{id}/ws - live progress for one run.
///
/// Sends the `state` snapshot first, then progress messages until
/// `run_completed`. Accepts `cancel_test` and `cancel_run` commands.
pub async fn run_socket(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_run(state, run_id, socket))
}

fn encode(message: &ProgressMessage) -> Option<WsMessage> {
    match serde_json::to_string(message) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(err) => {
            warn!(error = %err, kind = message.type_name(), "failed to encode progress message");
            None
        }
    }
}

/// Relay progress to the socket and commands from it until the run ends or
/// the client goes away.
async fn stream_run(state: Arc<AppState>, run_id: Uuid, socket: WebSocket) {
    let (mut outbound, mut inbound) = socket.split();

    let mut observer = match state.orchestrator.connect(run_id).await {
        Ok(observer) => observer,
        Err(err) => {
            if let Some(frame) = encode(&ProgressMessage::Error {
                message: err.to_string(),
            }) {
                let _ = outbound.send(frame).await;
            }
            let _ = outbound.close().await;
            return;
        }
    };
    debug!(%run_id, observer_id = observer.id, "observer connected");

    loop {
        tokio::select! {
            message = observer.recv() => {
                let Some(message) = message else { break };
                let finished = matches!(message, ProgressMessage::RunCompleted {});
                if let Some(frame) = encode(&message) {
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
                if finished {
                    break;
                }
            }
            frame = inbound.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                        Ok(command) => match state.orchestrator.handle_command(run_id, command).await {
                            Ok(_) => None,
                            Err(err) => Some(ProgressMessage::Error { message: err.to_string() }),
                        },
                        Err(err) => Some(ProgressMessage::Error {
                            message: format!("unrecognised command: {err}"),
                        }),
                    };
                    if let Some(frame) = reply.as_ref().and_then(encode) {
                        if outbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.orchestrator.disconnect(&observer).await;
    let _ = outbound.close().await;
    debug!(%run_id, observer_id = observer.id, "observer disconnected");
}
