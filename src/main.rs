use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tracing::{info, warn};

mod api;
mod camera_directory;
mod config;
mod database;
mod demux;
mod errors;
mod handlers;
mod mjpeg;
mod session;
mod transcoder;
mod utils;
mod websocket;

use camera_directory::CameraDirectory;
use config::Config;
use database::{DatabaseProvider, SqliteDatabase};
use session::SessionManager;

#[derive(Parser, Debug, Clone)]
#[command(name = "smartcam-server")]
#[command(about = "Camera dashboard backend with live RTSP to MJPEG relay")]
pub struct Args {
    /// Configuration file (TOML, or JSON/YAML by extension)
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    /// Override server.host
    #[arg(long)]
    pub host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseProvider>,
    pub directory: Arc<dyn CameraDirectory>,
    pub sessions: SessionManager,
    pub max_pending_frames: usize,
    pub static_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartcam_server=debug,info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        warn!("Could not find {}, using default configuration", args.config);
        Config::default()
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let database = Arc::new(SqliteDatabase::new(&config.database.path, config.database.max_connections).await?);
    database.initialize().await?;

    let sessions = SessionManager::new(config.transcoding.clone(), config.streaming.clone());
    let state = AppState {
        db: database.clone(),
        directory: database,
        sessions: sessions.clone(),
        max_pending_frames: config.streaming.max_pending_frames,
        static_dir: config.server.static_dir.clone(),
    };

    let app = build_router(state, &config);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown = shutdown_signal(sessions);

    match &config.server.tls {
        Some(tls_config) if tls_config.enabled => {
            info!("Starting HTTPS server on {}", addr);
            start_https_server(app, &addr, tls_config, shutdown).await?;
        }
        _ => {
            info!("Starting HTTP server on {}", addr);
            start_http_server(app, &addr, shutdown).await?;
        }
    }

    info!("Server shut down");
    Ok(())
}

fn build_router(state: AppState, config: &Config) -> Router {
    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => tower_http::cors::CorsLayer::new()
                    .allow_origin(origin_header)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/stream/:camera_id", get(handlers::camera_stream_handler))
        .route("/api/cameras", get(api::api_list_cameras).post(api::api_create_camera))
        .route(
            "/api/cameras/:id",
            get(api::api_get_camera)
                .put(api::api_update_camera)
                .delete(api::api_delete_camera),
        )
        .route("/api/alerts", get(api::api_list_alerts).post(api::api_create_alert))
        .route("/api/alerts/:id/verify", post(api::api_verify_alert))
        .route("/api/sessions", get(api::api_list_sessions))
        .nest_service("/static", tower_http::services::ServeDir::new(&config.server.static_dir))
        .fallback_service(tower_http::services::ServeDir::new(&config.server.static_dir))
        .layer(cors_layer)
        .with_state(state)
}

async fn shutdown_signal(sessions: SessionManager) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    let _ = ctrl_c.await;

    info!("Shutdown signal received");
    // Ends every MJPEG body, so open HTTP connections can drain.
    sessions.shutdown();
}

async fn start_http_server(
    app: Router,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn start_https_server(
    app: Router,
    addr: &str,
    tls_cfg: &config::TlsConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let cert_file = File::open(&tls_cfg.cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", tls_cfg.cert_path, e))?;
    let key_file = File::open(&tls_cfg.key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", tls_cfg.key_path, e))?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate: {}", e))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
    if keys.is_empty() {
        let mut key_reader = BufReader::new(File::open(&tls_cfg.key_path)?);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse RSA private key: {}", e))?;
    }
    let private_key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No private key found in key file"))?;

    let rustls_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(private_key))
        .map_err(|e| anyhow::anyhow!("Failed to create TLS config: {}", e))?;

    info!("HTTPS server listening on https://{} (certificate {})", addr, tls_cfg.cert_path);

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));
    axum_server::bind_rustls(addr.parse()?, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_directory::{CameraTarget, StaticCameraDirectory};
    use crate::config::{StreamingConfig, TranscodingConfig};
    use crate::session::testing::{repeating_frames, ScriptLauncher, FRAME};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;
    use tower::ServiceExt;

    fn camera() -> CameraTarget {
        CameraTarget {
            id: "1".to_string(),
            address: "192.0.2.1".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    async fn state_with(sessions: SessionManager) -> AppState {
        let db = Arc::new(SqliteDatabase::new(":memory:", 1).await.unwrap());
        db.initialize().await.unwrap();
        AppState {
            db,
            directory: Arc::new(StaticCameraDirectory::new([camera()])),
            sessions,
            max_pending_frames: 8,
            static_dir: Config::default().server.static_dir,
        }
    }

    async fn app_and_sessions(script: &str) -> (Router, SessionManager) {
        let sessions = SessionManager::with_launcher(
            ScriptLauncher::new(script),
            TranscodingConfig::default(),
            StreamingConfig::default(),
        );
        let app = build_router(state_with(sessions.clone()).await, &Config::default());
        (app, sessions)
    }

    async fn app_with_script(script: &str) -> Router {
        app_and_sessions(script).await.0
    }

    /// Waits for the session arena to empty and for the process to be reaped.
    #[cfg(unix)]
    async fn assert_torn_down(sessions: &SessionManager, pid: u32) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        tokio::time::timeout(Duration::from_secs(10), async {
            while sessions.count().await > 0 || kill(Pid::from_raw(pid as i32), None).is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session or stream process outlived the client");
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_camera_is_404() {
        let app = app_with_script("exit 0").await;
        let response = app.oneshot(get("/stream/99")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_transcoder_is_500() {
        let transcoding = TranscodingConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ..TranscodingConfig::default()
        };
        let sessions = SessionManager::new(transcoding, StreamingConfig::default());
        let app = build_router(state_with(sessions).await, &Config::default());

        let response = app.oneshot(get("/stream/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_before_first_frame_is_500() {
        let app = app_with_script("exit 1").await;
        let response = app.oneshot(get("/stream/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_cap_is_503() {
        let streaming = StreamingConfig { max_sessions: 0, ..StreamingConfig::default() };
        let sessions = SessionManager::with_launcher(ScriptLauncher::new("exit 0"), TranscodingConfig::default(), streaming);
        let app = build_router(state_with(sessions).await, &Config::default());

        let response = app.oneshot(get("/stream/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_multipart_frames() {
        let app = app_with_script(&format!("printf '{f}{f}'; exit 0", f = FRAME)).await;
        let response = app.oneshot(get("/stream/1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["content-type"], "multipart/x-mixed-replace; boundary=frame");
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let part = crate::mjpeg::format_part(&[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        let mut expected = part.to_vec();
        expected.extend_from_slice(&part);
        assert_eq!(body.as_ref(), expected.as_slice());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_the_http_body_ends_the_session() {
        let (app, sessions) = app_and_sessions(&repeating_frames()).await;
        let response = app.oneshot(get("/stream/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let pid = sessions.list().await[0].pid.expect("process has a pid");

        let mut body = response.into_body().into_data_stream();
        let part = tokio::time::timeout(Duration::from_secs(10), body.next())
            .await
            .expect("no part from stream")
            .unwrap()
            .unwrap();
        assert!(part.starts_with(b"--frame\r\n"));

        drop(body);
        assert_torn_down(&sessions, pid).await;
    }

    #[tokio::test]
    async fn root_serves_the_dashboard_without_upgrade() {
        let dir = std::env::temp_dir().join(format!("smartcam-static-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>dashboard</h1>").unwrap();
        std::fs::write(dir.join("app.js"), "console.log(1)").unwrap();

        let mut config = Config::default();
        config.server.static_dir = dir.to_string_lossy().into_owned();
        let sessions = SessionManager::with_launcher(
            ScriptLauncher::new("exit 0"),
            TranscodingConfig::default(),
            StreamingConfig::default(),
        );
        let mut state = state_with(sessions).await;
        state.static_dir = config.server.static_dir.clone();
        let app = build_router(state, &config);

        let response = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"<h1>dashboard</h1>");

        let response = app.clone().oneshot(get("/app.js")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(get("/static/app.js")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/ws")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn camera_and_alert_api() {
        let app = app_with_script("exit 0").await;

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/cameras", serde_json::json!({
                "name": "Gate",
                "ip_address": "10.1.1.1",
                "username": "u",
                "password": "p"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["data"]["id"].as_i64().unwrap();

        let response = app.clone().oneshot(get(&format!("/api/cameras/{}", id))).await.unwrap();
        let camera = body_json(response).await;
        assert_eq!(camera["status"], "success");
        assert_eq!(camera["data"]["ip_address"], "10.1.1.1");
        assert!(camera["data"].get("password").is_none());

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/cameras", serde_json::json!({ "ip_address": " " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/alerts", serde_json::json!({
                "camera_id": id,
                "uri": "/img/a.jpg",
                "result": "high",
                "confidence": 0.9
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let alert_id = body_json(response).await["data"]["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/alerts/{}/verify", alert_id),
                serde_json::json!({ "human_verification": true, "is_resolved": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let alerts = body_json(app.clone().oneshot(get("/api/alerts?limit=10")).await.unwrap()).await;
        assert_eq!(alerts["data"][0]["result"], "high");
        assert_eq!(alerts["data"][0]["human_verification"], true);

        let response = app.clone().oneshot(json_request("DELETE", &format!("/api/cameras/{}", id), serde_json::json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get(&format!("/api/cameras/{}", id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let app = app_with_script("exit 0").await;
        let health = body_json(app.oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["active_sessions"], 0);
    }

    type ClientSocket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn read_json(socket: &mut ClientSocket) -> serde_json::Value {
        let message = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("no message from server")
            .unwrap()
            .unwrap();
        serde_json::from_str(message.to_text().unwrap()).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn websocket_start_frames_and_stop() {
        let app = app_with_script(&format!("printf '{}'; exec sleep 30", FRAME)).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        socket.send(Message::Text("garbage".into())).await.unwrap();
        let reply = read_json(&mut socket).await;
        assert_eq!(reply, serde_json::json!({"type": "error", "message": "Invalid message format"}));

        socket.send(Message::Text(r#"{"type":"start_stream","cameraId":42}"#.into())).await.unwrap();
        let reply = read_json(&mut socket).await;
        assert_eq!(reply, serde_json::json!({"type": "error", "message": "Camera not found"}));

        socket.send(Message::Text(r#"{"type":"start_stream","cameraId":1}"#.into())).await.unwrap();
        let reply = read_json(&mut socket).await;
        assert_eq!(reply, serde_json::json!({"type": "stream_started", "cameraId": 1}));
        let frame = read_json(&mut socket).await;
        assert_eq!(frame["type"], "frame");
        assert_eq!(frame["data"], "/9gBAv/Z");

        socket.send(Message::Text(r#"{"type":"start_stream","cameraId":"1"}"#.into())).await.unwrap();
        let reply = read_json(&mut socket).await;
        assert_eq!(reply, serde_json::json!({"type": "error", "message": "Stream already active"}));

        socket.send(Message::Text(r#"{"type":"stop_stream"}"#.into())).await.unwrap();
        let reply = read_json(&mut socket).await;
        assert_eq!(reply, serde_json::json!({"type": "stream_stopped"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closing_the_websocket_ends_the_session() {
        let (app, sessions) = app_and_sessions(&repeating_frames()).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr)).await.unwrap();
        socket.send(Message::Text(r#"{"type":"start_stream","cameraId":"1"}"#.into())).await.unwrap();
        assert_eq!(read_json(&mut socket).await["type"], "stream_started");
        assert_eq!(read_json(&mut socket).await["type"], "frame");

        let pid = sessions.list().await[0].pid.expect("process has a pid");
        socket.close(None).await.unwrap();
        drop(socket);
        assert_torn_down(&sessions, pid).await;
    }
}
