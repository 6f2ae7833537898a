use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PixyStreamError;

pub const DEFAULT_MAX_RETRIES: u32 = 7;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;

/// How much of each event the stream hands back.
///
/// `Tokens` reduces events to plain text and treats a `length` finish reason
/// as a failure; `Raw` forwards structured payloads untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Tokens,
    Raw,
}

impl std::str::FromStr for StreamMode {
    type Err = PixyStreamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tokens" => Ok(StreamMode::Tokens),
            "raw" => Ok(StreamMode::Raw),
            other => Err(PixyStreamError::Config(format!(
                "unknown stream mode '{other}', expected 'tokens' or 'raw'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_INITIAL_DELAY_MS)
    }
}

/// Passed to the rate-limit hook right before a backoff sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitNotice {
    pub retries: u32,
    pub delay: Duration,
}

/// One decoded event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub text: String,
    pub value: Value,
}

impl Frame {
    pub fn new(text: impl Into<String>, value: Value) -> Self {
        Self {
            text: text.into(),
            value,
        }
    }

    pub fn choices(&self) -> &[Value] {
        self.value
            .get("choices")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Output of one framing or transform step. `Done` and `Error` end the stream.
#[derive(Debug)]
pub enum StreamSignal<T = Frame> {
    Data(T),
    Done,
    Error(PixyStreamError),
}

impl<T> StreamSignal<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamSignal::Data(_))
    }
}
