use axum::extract::{Path as AxumPath, Request, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::errors::StreamError;
use crate::mjpeg::{stream_response, MultipartSink};
use crate::session::Protocol;
use crate::websocket;
use crate::AppState;

/// `GET /`: the dashboard's WebSocket when upgrading, its static index otherwise.
pub async fn root_handler(ws: Option<WebSocketUpgrade>, State(state): State<AppState>, request: Request) -> Response {
    if let Some(ws) = ws {
        return websocket::upgrade(ws, state);
    }
    let mut files = ServeDir::new(&state.static_dir);
    match files.try_call(request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            warn!("Failed to serve {}: {}", state.static_dir, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Static file error").into_response()
        }
    }
}

/// `GET /stream/{camera_id}`: MJPEG over `multipart/x-mixed-replace`.
///
/// Headers are only sent once the first frame is queued, so failures before
/// that still get a proper status code.
pub async fn camera_stream_handler(
    State(state): State<AppState>,
    AxumPath(camera_id): AxumPath<String>,
) -> Response {
    let target = match state.directory.resolve(&camera_id).await {
        Ok(Some(target)) => target,
        Ok(None) => {
            debug!("Stream requested for unknown camera {}", camera_id);
            return (StatusCode::NOT_FOUND, "Camera not found").into_response();
        }
        Err(e) => {
            warn!("Camera lookup for {} failed: {}", camera_id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Camera lookup failed").into_response();
        }
    };

    let (sink, parts) = MultipartSink::channel(state.max_pending_frames);
    let mut session = match state.sessions.start(target, Protocol::Http, sink).await {
        Ok(session) => session,
        Err(e @ StreamError::SessionLimit { .. }) => {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
        Err(e) => {
            warn!("Could not start stream for camera {}: {}", camera_id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Stream error").into_response();
        }
    };

    if let Err(reason) = session.wait_ready().await {
        warn!("Stream for camera {} ended before the first frame: {}", camera_id, reason);
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("Stream error: {}", reason)).into_response();
    }

    info!("Streaming camera {} over HTTP (session {})", camera_id, session.id());
    stream_response(parts, session)
}

pub async fn health_handler(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.sessions.count().await,
    }))
    .into_response()
}
