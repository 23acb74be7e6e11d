//! Error types for the proxy.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Missing API key: supply a Bearer token, an x-goog-api-key header, or a key query parameter")]
    MissingCredential,

    #[error("Invalid request: {message}")]
    MalformedRequest { message: String },

    #[error("Upstream transport error: {message}")]
    Transport { message: String },

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// HTTP status the proxy answers with when this error ends a request.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingCredential => 401,
            Self::MalformedRequest { .. } | Self::Json(_) => 400,
            Self::Transport { .. } | Self::Http(_) => 502,
            _ => 500,
        }
    }

    /// OpenAI `error.type` string for this error.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::MissingCredential => "authentication_error",
            Self::MalformedRequest { .. } | Self::Json(_) => "invalid_request_error",
            Self::Transport { .. } | Self::Http(_) => "upstream_error",
            _ => "server_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
