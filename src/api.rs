use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::database::{CameraInput, NewAlert};
use crate::errors::StreamError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiResponse::<()>::error(message, status.as_u16()))).into_response()
}

fn database_error(context: &str, e: StreamError) -> Response {
    error!("{}: {}", context, e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}: {}", context, e))
}

fn validate_camera(camera: &CameraInput) -> Option<Response> {
    if camera.ip_address.trim().is_empty() {
        return Some(error_response(StatusCode::BAD_REQUEST, "ip_address is required"));
    }
    None
}

pub async fn api_list_cameras(State(state): State<AppState>) -> Response {
    match state.db.list_cameras().await {
        Ok(cameras) => Json(ApiResponse::success(cameras)).into_response(),
        Err(e) => database_error("Failed to list cameras", e),
    }
}

pub async fn api_get_camera(State(state): State<AppState>, AxumPath(id): AxumPath<i64>) -> Response {
    match state.db.get_camera(id).await {
        Ok(Some(camera)) => Json(ApiResponse::success(camera)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Camera not found"),
        Err(e) => database_error("Failed to load camera", e),
    }
}

pub async fn api_create_camera(State(state): State<AppState>, Json(camera): Json<CameraInput>) -> Response {
    if let Some(rejection) = validate_camera(&camera) {
        return rejection;
    }
    match state.db.create_camera(&camera).await {
        Ok(id) => {
            info!("Camera {} created ({})", id, camera.ip_address);
            (
                StatusCode::CREATED,
                Json(ApiResponse::success(serde_json::json!({
                    "message": "Camera created successfully",
                    "id": id
                }))),
            )
                .into_response()
        }
        Err(e) => database_error("Failed to create camera", e),
    }
}

pub async fn api_update_camera(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(camera): Json<CameraInput>,
) -> Response {
    if let Some(rejection) = validate_camera(&camera) {
        return rejection;
    }
    match state.db.update_camera(id, &camera).await {
        Ok(true) => {
            info!("Camera {} updated", id);
            Json(ApiResponse::success(serde_json::json!({
                "message": "Camera updated successfully",
                "id": id
            })))
            .into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Camera not found"),
        Err(e) => database_error("Failed to update camera", e),
    }
}

pub async fn api_delete_camera(State(state): State<AppState>, AxumPath(id): AxumPath<i64>) -> Response {
    match state.db.delete_camera(id).await {
        Ok(true) => {
            info!("Camera {} deleted", id);
            Json(ApiResponse::success(serde_json::json!({
                "message": "Camera deleted successfully",
                "id": id
            })))
            .into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Camera not found"),
        Err(e) => database_error("Failed to delete camera", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<i64>,
}

pub async fn api_list_alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> Response {
    match state.db.list_alerts(query.limit).await {
        Ok(alerts) => Json(ApiResponse::success(alerts)).into_response(),
        Err(e) => database_error("Failed to list alerts", e),
    }
}

pub async fn api_create_alert(State(state): State<AppState>, Json(alert): Json<NewAlert>) -> Response {
    if alert.uri.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "uri is required");
    }
    if let Some(confidence) = alert.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return error_response(StatusCode::BAD_REQUEST, "confidence must be between 0 and 1");
        }
    }
    match state.db.create_alert(&alert).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(serde_json::json!({ "id": id }))),
        )
            .into_response(),
        Err(e) => database_error("Failed to create alert", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyAlertRequest {
    pub human_verification: bool,
    pub is_resolved: bool,
}

pub async fn api_verify_alert(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(request): Json<VerifyAlertRequest>,
) -> Response {
    match state.db.verify_alert(id, request.human_verification, request.is_resolved).await {
        Ok(true) => {
            info!(
                "Alert {} verified (confirmed: {}, resolved: {})",
                id, request.human_verification, request.is_resolved
            );
            Json(ApiResponse::success(serde_json::json!({
                "message": "Alert updated successfully",
                "id": id
            })))
            .into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Alert not found"),
        Err(e) => database_error("Failed to update alert", e),
    }
}

pub async fn api_list_sessions(State(state): State<AppState>) -> Response {
    Json(ApiResponse::success(state.sessions.list().await)).into_response()
}
