use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of failure kinds a stream can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NoApiKey,
    InvalidApiKey,
    InvalidModel,
    MaxTokens,
    Unknown,
}

impl ErrorKind {
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::NoApiKey => "No API key was provided with the request.",
            ErrorKind::InvalidApiKey => "The API key sent with the request was rejected.",
            ErrorKind::InvalidModel => "The requested model does not exist or is not available.",
            ErrorKind::MaxTokens => {
                "Maximum number of tokens reached before the response finished. \
                 Raise max_tokens or shorten the prompt."
            }
            ErrorKind::Unknown => "An unknown error occurred while streaming the response.",
        }
    }
}

/// A taxonomy error: the kind plus its fixed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    kind: ErrorKind,
    message: &'static str,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.message(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &'static str {
        self.message
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"kind\":\"UNKNOWN\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl From<ErrorKind> for ErrorRecord {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl Display for ErrorRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorRecord {}

#[derive(Debug, Error)]
pub enum PixyStreamError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("rate limit still reached after {retries} retries")]
    MaxRetriesExceeded { retries: u32 },

    #[error("upstream error: {message}")]
    Upstream {
        message: String,
        details: Option<Value>,
    },

    #[error(transparent)]
    Record(#[from] ErrorRecord),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file {}: {message}", path.display())]
    ConfigFile { path: PathBuf, message: String },
}

impl PixyStreamError {
    /// Builds an upstream error from the `error` member of a payload.
    pub fn upstream(error: &Value) -> Self {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
            .unwrap_or_else(|| error.to_string());
        Self::Upstream {
            message,
            details: Some(error.clone()),
        }
    }

    /// Maps the failure onto the taxonomy where it can be recognized.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PixyStreamError::Record(record) => record.kind(),
            PixyStreamError::Upstream { details, .. } => details
                .as_ref()
                .map(classify_upstream)
                .unwrap_or(ErrorKind::Unknown),
            PixyStreamError::Http { status: 401, .. } => ErrorKind::InvalidApiKey,
            _ => ErrorKind::Unknown,
        }
    }
}

fn classify_upstream(details: &Value) -> ErrorKind {
    let code = details
        .get("code")
        .and_then(Value::as_str)
        .or_else(|| details.get("type").and_then(Value::as_str))
        .unwrap_or_default();
    match code {
        "invalid_api_key" => ErrorKind::InvalidApiKey,
        "model_not_found" => ErrorKind::InvalidModel,
        "context_length_exceeded" => ErrorKind::MaxTokens,
        _ => ErrorKind::Unknown,
    }
}
