//! Streaming plumbing for OpenAI-style completion endpoints: rate-limit
//! backoff, server-sent-event framing and composable text pipelines.

mod backoff;
mod config;
mod decoder;
mod error;
mod extractor;
mod fetch;
mod framer;
mod pipeline;
mod source;
mod stream;
mod types;

pub use backoff::{execute_with_backoff, retry_rate_limited, RateLimitHook};
pub use config::{
    default_config_path, load_config, parse_config, parse_config_with_env, LogConfig,
    PixyStreamConfig, INITIAL_DELAY_ENV, MAX_RETRIES_ENV,
};
pub use decoder::Utf8Decoder;
pub use error::{ErrorKind, ErrorRecord, PixyStreamError};
pub use extractor::{ChatDeltas, CompletionTokens, ExtractStage, Extractor, RawFrames};
pub use fetch::{Fetch, FetchFuture, FetchRequest, FetchResponse, HttpFetch};
pub use framer::SseFramer;
pub use pipeline::{CallbackTap, DoneHook, ParseHook, Pipeline, SignalStream, Stage, TextStream};
pub use source::{ByteSource, ChunkSender, ChunkStream};
pub use stream::{open_stream, text_stream, StreamOptions};
pub use types::{
    Frame, RateLimitNotice, RetryPolicy, StreamMode, StreamSignal, DEFAULT_INITIAL_DELAY_MS,
    DEFAULT_MAX_RETRIES,
};
