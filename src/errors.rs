use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Failed to start transcoder: {message}")]
    ProcessStart { message: String },

    #[error("Session limit reached ({max} active sessions)")]
    SessionLimit { max: usize },

    #[error("Stream closed: {message}")]
    StreamClosed { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn process_start(message: impl Into<String>) -> Self {
        Self::ProcessStart { message: message.into() }
    }

    pub fn stream_closed(message: impl Into<String>) -> Self {
        Self::StreamClosed { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
