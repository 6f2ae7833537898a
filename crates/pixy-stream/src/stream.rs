use serde_json::Value;
use tracing::info;

use crate::backoff::{execute_with_backoff, RateLimitHook};
use crate::config::PixyStreamConfig;
use crate::error::PixyStreamError;
use crate::extractor::{ExtractStage, Extractor};
use crate::fetch::{Fetch, FetchRequest, FetchResponse};
use crate::framer::SseFramer;
use crate::pipeline::{CallbackTap, DoneHook, ParseHook, Pipeline, TextStream};
use crate::source::ByteSource;
use crate::types::{RateLimitNotice, RetryPolicy, StreamMode};

/// Everything `open_stream` needs besides the request itself.
#[derive(Default)]
pub struct StreamOptions {
    pub mode: StreamMode,
    pub retry: RetryPolicy,
    pub on_rate_limited: Option<Box<RateLimitHook>>,
    pub on_parse: Option<ParseHook>,
    pub on_done: Option<DoneHook>,
}

impl StreamOptions {
    pub fn from_config(config: &PixyStreamConfig) -> Self {
        Self {
            mode: config.mode,
            retry: config.retry,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_rate_limited(
        mut self,
        hook: impl FnMut(RateLimitNotice) + Send + 'static,
    ) -> Self {
        self.on_rate_limited = Some(Box::new(hook));
        self
    }

    pub fn on_parse(mut self, hook: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_parse = Some(Box::new(hook));
        self
    }

    pub fn on_done(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_done = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("mode", &self.mode)
            .field("retry", &self.retry)
            .field("on_rate_limited", &self.on_rate_limited.is_some())
            .field("on_parse", &self.on_parse.is_some())
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

/// Sends `request` with rate-limit backoff and returns its body as a text
/// stream shaped by `extractor`.
///
/// A failed response that is not a rate limit never produces a stream: it
/// becomes `Upstream` when the body carries `error.message`, `Http`
/// otherwise.
pub async fn open_stream<E>(
    fetch: Option<&dyn Fetch>,
    request: &FetchRequest,
    extractor: E,
    mut options: StreamOptions,
) -> Result<TextStream, PixyStreamError>
where
    E: Extractor + 'static,
{
    info!(url = %request.url, mode = ?options.mode, "opening stream");
    let response = execute_with_backoff(
        fetch,
        request,
        &options.retry,
        options.on_rate_limited.as_deref_mut(),
    )
    .await?;

    if !response.is_ok() {
        return Err(error_from_response(response).await);
    }

    Ok(text_stream(
        response.into_body(),
        extractor,
        options.mode,
        options.on_parse,
        options.on_done,
    ))
}

/// Frames, extracts and taps an already-open byte source.
pub fn text_stream<E>(
    source: ByteSource,
    extractor: E,
    mode: StreamMode,
    on_parse: Option<ParseHook>,
    on_done: Option<DoneHook>,
) -> TextStream
where
    E: Extractor + 'static,
{
    let pipeline = Pipeline::new(source)
        .pipe(SseFramer::new(mode))
        .pipe(ExtractStage::new(extractor, mode))
        .pipe(CallbackTap::new(on_parse));
    TextStream::new(pipeline, on_done)
}

async fn error_from_response(response: FetchResponse) -> PixyStreamError {
    let status = response.status;
    let bytes = match response.into_body().read_to_end().await {
        Ok(bytes) => bytes,
        Err(error) => return error,
    };
    if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
        if let Some(error) = value.get("error") {
            if error.get("message").and_then(Value::as_str).is_some() {
                return PixyStreamError::upstream(error);
            }
        }
    }
    PixyStreamError::Http {
        status,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    }
}
