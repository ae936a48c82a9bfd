use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::errors::{Result, StreamError};
use crate::utils::duration_format;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transcoding: TranscodingConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub cors_allow_origin: Option<String>,
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// How the transcoding subprocess is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,    // -rtsp_transport, "tcp" keeps frame boundaries intact
    #[serde(default = "default_rtsp_path")]
    pub rtsp_path: String,         // path appended to the camera address
    #[serde(default = "default_rw_timeout_us")]
    pub rw_timeout_us: u64,        // -rw_timeout in microseconds
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default)]
    pub extra_input_args: Vec<String>,
    #[serde(default)]
    pub extra_output_args: Vec<String>,
    #[serde(default = "default_chunk_read_size")]
    pub chunk_read_size: usize,
    #[serde(default)]
    pub log_stderr: bool,          // log ffmpeg stderr at info instead of debug
    #[serde(default = "OutputSpec::http_default")]
    pub http: OutputSpec,
    #[serde(default = "OutputSpec::websocket_default")]
    pub websocket: OutputSpec,
}

/// Output parameters handed to the transcoder for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default = "default_output_format")]
    pub format: String,            // -f
    pub quality: u8,               // -q:v (2 best .. 31 worst)
    pub framerate: u32,            // -r
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_pending_frames")]
    pub max_pending_frames: usize, // frames queued per client before it counts as slow
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,       // stdout chunks queued between process and session
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_garbage_warn_bytes")]
    pub garbage_warn_bytes: u64,
    #[serde(with = "duration_format", default = "default_start_timeout")]
    pub start_timeout: Duration,
    #[serde(with = "duration_format", default = "default_stop_timeout")]
    pub stop_timeout: Duration,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3000 }
fn default_static_dir() -> String { "static".to_string() }
fn default_database_path() -> String { "data/smartcam.db".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_rtsp_transport() -> String { "tcp".to_string() }
fn default_rtsp_path() -> String { "live0".to_string() }
fn default_rw_timeout_us() -> u64 { 5_000_000 }
fn default_loglevel() -> String { "error".to_string() }
fn default_chunk_read_size() -> usize { 8192 }
fn default_output_format() -> String { "mjpeg".to_string() }
fn default_max_sessions() -> usize { 32 }
fn default_max_pending_frames() -> usize { 8 }
fn default_event_buffer() -> usize { 16 }
fn default_max_frame_bytes() -> usize { 8 * 1024 * 1024 } // 8MB
fn default_garbage_warn_bytes() -> u64 { 1024 * 1024 }
fn default_start_timeout() -> Duration { Duration::from_secs(15) }
fn default_stop_timeout() -> Duration { Duration::from_secs(3) }

impl OutputSpec {
    pub fn http_default() -> Self {
        Self {
            format: default_output_format(),
            quality: 3,
            framerate: 10,
            width: 640,
            height: 480,
        }
    }

    pub fn websocket_default() -> Self {
        Self {
            format: default_output_format(),
            quality: 5,
            framerate: 15,
            width: 640,
            height: 480,
        }
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: None,
            cors_allow_origin: Some("*".to_string()),
            static_dir: default_static_dir(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            rtsp_transport: default_rtsp_transport(),
            rtsp_path: default_rtsp_path(),
            rw_timeout_us: default_rw_timeout_us(),
            loglevel: default_loglevel(),
            extra_input_args: Vec::new(),
            extra_output_args: Vec::new(),
            chunk_read_size: default_chunk_read_size(),
            log_stderr: false,
            http: OutputSpec::http_default(),
            websocket: OutputSpec::websocket_default(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_pending_frames: default_max_pending_frames(),
            event_buffer: default_event_buffer(),
            max_frame_bytes: default_max_frame_bytes(),
            garbage_warn_bytes: default_garbage_warn_bytes(),
            start_timeout: default_start_timeout(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = match Path::new(path).extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        config.validate()?;
        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transcoding.ffmpeg_path.trim().is_empty() {
            return Err(StreamError::config("transcoding.ffmpeg_path must not be empty"));
        }
        if self.transcoding.chunk_read_size == 0 {
            return Err(StreamError::config("transcoding.chunk_read_size must be greater than zero"));
        }
        for (name, spec) in [("http", &self.transcoding.http), ("websocket", &self.transcoding.websocket)] {
            if spec.framerate == 0 || spec.width == 0 || spec.height == 0 {
                return Err(StreamError::config(format!(
                    "transcoding.{}: framerate and resolution must be non-zero", name
                )));
            }
            if !(2..=31).contains(&spec.quality) {
                return Err(StreamError::config(format!(
                    "transcoding.{}: quality must be between 2 and 31, got {}", name, spec.quality
                )));
            }
        }
        if self.streaming.max_sessions == 0 || self.streaming.max_pending_frames == 0 || self.streaming.event_buffer == 0 {
            return Err(StreamError::config(
                "streaming.max_sessions, max_pending_frames and event_buffer must be greater than zero",
            ));
        }
        if self.streaming.max_frame_bytes < 4 {
            return Err(StreamError::config("streaming.max_frame_bytes is too small to hold a JPEG"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_profiles() {
        let config = Config::default();
        assert_eq!(config.transcoding.rtsp_transport, "tcp");
        assert_eq!(config.transcoding.http.framerate, 10);
        assert_eq!(config.transcoding.http.quality, 3);
        assert_eq!(config.transcoding.websocket.framerate, 15);
        assert_eq!(config.transcoding.websocket.resolution(), "640x480");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [transcoding.http]
            quality = 4
            framerate = 12
            width = 320
            height = 240

            [streaming]
            max_pending_frames = 2
            start_timeout = "3s"
            "#,
        ).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.transcoding.http.format, "mjpeg");
        assert_eq!(config.transcoding.http.resolution(), "320x240");
        assert_eq!(config.transcoding.websocket, OutputSpec::websocket_default());
        assert_eq!(config.streaming.max_pending_frames, 2);
        assert_eq!(config.streaming.start_timeout, Duration::from_secs(3));
        assert_eq!(config.streaming.stop_timeout, Duration::from_secs(3));
    }

    #[test]
    fn yaml_and_json_are_accepted() {
        let yaml: Config = serde_yaml::from_str("streaming:\n  max_sessions: 4\n").unwrap();
        assert_eq!(yaml.streaming.max_sessions, 4);

        let json: Config = serde_json::from_str(r#"{"database": {"path": "x.db"}}"#).unwrap();
        assert_eq!(json.database.path, "x.db");
        assert_eq!(json.database.max_connections, 10);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transcoding.http.quality = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.streaming.max_pending_frames = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transcoding.ffmpeg_path = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let result: std::result::Result<Config, _> = toml::from_str("[streaming]\nstop_timeout = \"soon\"\n");
        assert!(result.is_err());
    }
}
