use std::fmt;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::demux::Frame;
use crate::session::{CloseReason, FrameSink, Protocol, SessionHandle, SinkError};
use crate::utils::now_millis;
use crate::AppState;

/// Camera ids arrive either as JSON strings or numbers and are echoed back as sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CameraId {
    Number(i64),
    Text(String),
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraId::Number(id) => write!(f, "{}", id),
            CameraId::Text(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    StartStream {
        #[serde(rename = "cameraId")]
        camera_id: CameraId,
    },
    StopStream,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    StreamStarted {
        #[serde(rename = "cameraId")]
        camera_id: CameraId,
    },
    StreamStopped,
    Frame { data: String, timestamp: i64 },
    Error { message: String },
}

impl ServerMessage {
    fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    fn into_message(self) -> serde_json::Result<Message> {
        serde_json::to_string(&self).map(Message::Text)
    }
}

/// Sends frames as base64 JSON text messages through the socket's writer task.
pub struct WsSink {
    tx: mpsc::Sender<Message>,
    capacity: usize,
}

impl WsSink {
    pub fn new(tx: mpsc::Sender<Message>, capacity: usize) -> Self {
        Self { tx, capacity }
    }
}

impl FrameSink for WsSink {
    fn send(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let message = ServerMessage::Frame {
            data: base64::engine::general_purpose::STANDARD.encode(frame.as_bytes()),
            timestamp: now_millis(),
        };
        let message = message
            .into_message()
            .map_err(|e| SinkError::Other { message: e.to_string() })?;
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::Full { pending: self.capacity }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let tx = self.tx.clone();
        Box::pin(async move { tx.closed().await })
    }

    fn on_close(&mut self, reason: &CloseReason) {
        if !reason.is_error() {
            return;
        }
        // The queue may be full (slow client), so wait for room instead of dropping it.
        let tx = self.tx.clone();
        let message = ServerMessage::error(reason.to_string());
        tokio::spawn(async move { send(&tx, message).await });
    }
}

pub async fn websocket_handler(ws: Option<WebSocketUpgrade>, State(state): State<AppState>) -> Response {
    match ws {
        Some(ws) => upgrade(ws, state),
        None => (StatusCode::BAD_REQUEST, "This endpoint only accepts WebSocket connections").into_response(),
    }
}

pub fn upgrade(ws: WebSocketUpgrade, state: AppState) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(state.max_pending_frames.max(1));
    let mut writer = tokio::spawn(write_messages(sender, rx));
    let mut session: Option<SessionHandle> = None;

    info!("WebSocket client {} connected", client_id);

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    trace!("[{}] Received: {}", client_id, text);
                    handle_text(&text, &state, &tx, &mut session).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    send(&tx, ServerMessage::error("Invalid message format")).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("[{}] WebSocket error: {}", client_id, e);
                    break;
                }
                _ => {}
            },
            _ = &mut writer => {
                debug!("[{}] WebSocket writer ended", client_id);
                break;
            }
        }
    }

    if let Some(mut session) = session.take() {
        session.close();
    }
    info!("WebSocket client {} disconnected", client_id);
}

async fn handle_text(
    text: &str,
    state: &AppState,
    tx: &mpsc::Sender<Message>,
    session: &mut Option<SessionHandle>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Rejecting WebSocket message: {}", e);
            send(tx, ServerMessage::error("Invalid message format")).await;
            return;
        }
    };

    match message {
        ClientMessage::StartStream { camera_id } => {
            if session.as_ref().is_some_and(SessionHandle::is_active) {
                send(tx, ServerMessage::error("Stream already active")).await;
                return;
            }

            let target = match state.directory.resolve(&camera_id.to_string()).await {
                Ok(Some(target)) => target,
                Ok(None) => {
                    send(tx, ServerMessage::error("Camera not found")).await;
                    return;
                }
                Err(e) => {
                    warn!("Camera lookup for {} failed: {}", camera_id, e);
                    send(tx, ServerMessage::error(e.to_string())).await;
                    return;
                }
            };

            // Queued before the session exists so it always precedes the first frame.
            send(tx, ServerMessage::StreamStarted { camera_id: camera_id.clone() }).await;

            let sink = WsSink::new(tx.clone(), state.max_pending_frames.max(1));
            match state.sessions.start(target, Protocol::WebSocket, sink).await {
                Ok(handle) => *session = Some(handle),
                Err(e) => {
                    warn!("Could not start stream for camera {}: {}", camera_id, e);
                    send(tx, ServerMessage::error(e.to_string())).await;
                }
            }
        }
        ClientMessage::StopStream => {
            if let Some(mut handle) = session.take() {
                handle.close();
                handle.closed().await;
            }
            send(tx, ServerMessage::StreamStopped).await;
        }
    }
}

async fn send(tx: &mpsc::Sender<Message>, message: ServerMessage) {
    match message.into_message() {
        Ok(message) => {
            let _ = tx.send(message).await;
        }
        Err(e) => warn!("Failed to encode WebSocket message: {}", e),
    }
}

async fn write_messages(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sender.send(message).await {
            debug!("WebSocket send failed: {}", e);
            break;
        }
    }
    let _ = sender.close().await;
}
