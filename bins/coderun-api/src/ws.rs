// WebSocket session transport
//
// One socket = one session sink. Clients send `execute_code` / `stop_code`
// messages; every engine event for the session is pushed back as JSON.
// Closing the socket detaches the sink but leaves a running job alone.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use coderun_common::types::{ExecutionEvent, ExecutionRequest};
use coderun_engine::EventSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers;
use crate::metrics::MeteredSink;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ExecuteCode {
        code: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
    StopCode,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    Session {
        session_id: String,
    },
    ExecutionAccepted {
        job_id: Uuid,
    },
    ExecutionRejected {
        reason: &'static str,
        message: String,
    },
    StopResult {
        ok: bool,
        job_id: Option<Uuid>,
        reason: Option<&'static str>,
    },
    ProtocolError {
        message: String,
    },
}

/// Everything written to the socket, engine events and replies alike.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Event(ExecutionEvent),
    Reply(ServerMessage),
}

/// Engine-facing half of the socket's outbound queue.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &ExecutionEvent) -> bool {
        self.tx.send(Outbound::Event(event.clone())).is_ok()
    }
}

/// GET /ws - Upgrade to a session socket
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let session_id = params
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let sink: Arc<dyn EventSink> = Arc::new(MeteredSink::new(ChannelSink { tx: tx.clone() }));
    state.coordinator.registry().attach_sink(&session_id, sink.clone());
    info!(session_id = %session_id, "Client connected");

    let _ = tx.send(Outbound::Reply(ServerMessage::Session {
        session_id: session_id.clone(),
    }));

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(incoming) = receiver.next().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Socket read error");
                break;
            }
        };

        let reply = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => handle_message(&state, &session_id, message),
            Err(e) => ServerMessage::ProtocolError {
                message: format!("Invalid message: {}", e),
            },
        };
        if tx.send(Outbound::Reply(reply)).is_err() {
            break;
        }
    }

    // Disconnect stops delivery only; a running job keeps going.
    state
        .coordinator
        .registry()
        .detach_sink_if_current(&session_id, &sink);
    writer.abort();
    info!(
        session_id = %session_id,
        job_running = state.coordinator.active_job(&session_id).is_some(),
        "Client disconnected"
    );
}

pub fn handle_message(state: &AppState, session_id: &str, message: ClientMessage) -> ServerMessage {
    match message {
        ClientMessage::ExecuteCode { code, timeout } => {
            match handlers::submit(state, ExecutionRequest::new(session_id, code, timeout)) {
                Ok(job_id) => ServerMessage::ExecutionAccepted { job_id },
                Err(rejection) => ServerMessage::ExecutionRejected {
                    reason: rejection.reason(),
                    message: rejection.to_string(),
                },
            }
        }
        ClientMessage::StopCode => match state.coordinator.cancel(session_id) {
            Ok(job_id) => ServerMessage::StopResult {
                ok: true,
                job_id: Some(job_id),
                reason: None,
            },
            Err(e) => ServerMessage::StopResult {
                ok: false,
                job_id: None,
                reason: Some(e.reason()),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_common::config::{EngineConfig, InterpreterConfig};
    use coderun_engine::{Coordinator, SessionRegistry};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"execute_code","code":"print(1)","timeout":5}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ExecuteCode {
                code: "print(1)".to_string(),
                timeout: Some(5)
            }
        );
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop_code"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StopCode);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let value = serde_json::to_value(Outbound::Reply(ServerMessage::StopResult {
            ok: false,
            job_id: None,
            reason: Some("NoActiveJob"),
        }))
        .unwrap();
        assert_eq!(value["event"], "stop_result");
        assert_eq!(value["reason"], "NoActiveJob");
    }

    #[tokio::test]
    async fn test_socket_messages_drive_engine() {
        let scratch = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            kill_grace_secs: 0.5,
            interpreter: InterpreterConfig {
                command: "sh".to_string(),
                args: vec![],
                file_extension: "sh".to_string(),
                env: BTreeMap::new(),
            },
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let state = AppState {
            coordinator: Coordinator::new(config, Arc::new(SessionRegistry::new())),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .coordinator
            .registry()
            .attach_sink("ws", Arc::new(ChannelSink { tx }));

        let reply = handle_message(
            &state,
            "ws",
            ClientMessage::ExecuteCode {
                code: "echo hello".to_string(),
                timeout: None,
            },
        );
        let job_id = match reply {
            ServerMessage::ExecutionAccepted { job_id } => job_id,
            other => panic!("unexpected reply: {other:?}"),
        };

        let mut saw_output = false;
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            match next {
                Outbound::Event(ExecutionEvent::OutputFrame(frame)) => {
                    assert_eq!(frame.job_id, job_id);
                    assert_eq!(frame.text, "hello");
                    saw_output = true;
                }
                Outbound::Event(ExecutionEvent::ExecutionFinished(done)) => {
                    assert!(done.success);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_output);

        match handle_message(&state, "ws", ClientMessage::StopCode) {
            ServerMessage::StopResult { ok, reason, .. } => {
                assert!(!ok);
                assert_eq!(reason, Some("NoActiveJob"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
