use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::debug;

use crate::decoder::Utf8Decoder;
use crate::error::PixyStreamError;
use crate::types::StreamSignal;

pub type SignalStream<T> = Pin<Box<dyn Stream<Item = Result<T, PixyStreamError>> + Send>>;
pub type ParseHook = Box<dyn FnMut(&str) + Send>;
pub type DoneHook = Box<dyn FnOnce() + Send>;

/// One step of a pipeline: maps each input to zero or more signals.
///
/// `Done` or `Error` from a stage ends the pipeline; anything queued after it
/// is dropped and the upstream is released.
pub trait Stage: Send {
    type Input;
    type Output;

    fn transform(&mut self, input: Self::Input) -> Vec<StreamSignal<Self::Output>>;

    /// Called once when the upstream ends without a terminal signal.
    fn finish(&mut self) -> Vec<StreamSignal<Self::Output>> {
        Vec::new()
    }
}

/// A stream of items built by chaining stages onto a source.
pub struct Pipeline<T> {
    stream: SignalStream<T>,
}

impl<T> Pipeline<T>
where
    T: Send + 'static,
{
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = Result<T, PixyStreamError>> + Send + 'static,
    {
        Self {
            stream: Box::pin(source),
        }
    }

    pub fn pipe<G>(self, stage: G) -> Pipeline<G::Output>
    where
        G: Stage<Input = T> + 'static,
        G::Output: Send + 'static,
    {
        Pipeline {
            stream: Box::pin(StageStream {
                upstream: Some(self.stream),
                stage,
                queue: VecDeque::new(),
                closed: false,
            }),
        }
    }
}

impl<T> Stream for Pipeline<T> {
    type Item = Result<T, PixyStreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

struct StageStream<G: Stage> {
    upstream: Option<SignalStream<G::Input>>,
    stage: G,
    queue: VecDeque<StreamSignal<G::Output>>,
    closed: bool,
}

// The stage is never pinned; only the boxed upstream is polled through a pin.
impl<G: Stage> Unpin for StageStream<G> {}

impl<G: Stage> StageStream<G> {
    fn close(&mut self) {
        self.closed = true;
        self.upstream = None;
        self.queue.clear();
    }
}

impl<G: Stage> Stream for StageStream<G> {
    type Item = Result<G::Output, PixyStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(signal) = this.queue.pop_front() {
                match signal {
                    StreamSignal::Data(item) => return Poll::Ready(Some(Ok(item))),
                    StreamSignal::Done => {
                        this.close();
                        return Poll::Ready(None);
                    }
                    StreamSignal::Error(error) => {
                        this.close();
                        return Poll::Ready(Some(Err(error)));
                    }
                }
            }

            if this.closed {
                return Poll::Ready(None);
            }
            let Some(upstream) = this.upstream.as_mut() else {
                this.closed = true;
                return Poll::Ready(None);
            };

            match upstream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(input))) => {
                    let signals = this.stage.transform(input);
                    this.queue.extend(signals);
                }
                Poll::Ready(Some(Err(error))) => {
                    this.close();
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.upstream = None;
                    let signals = this.stage.finish();
                    this.queue.extend(signals);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Pass-through stage that reports every decoded text unit to a hook.
///
/// Chunks are decoded incrementally, so a chunk holding only part of a
/// multi-byte character emits nothing until the character completes.
pub struct CallbackTap {
    decoder: Utf8Decoder,
    on_parse: Option<ParseHook>,
}

impl CallbackTap {
    pub fn new(on_parse: Option<ParseHook>) -> Self {
        Self {
            decoder: Utf8Decoder::new(),
            on_parse,
        }
    }

    fn emit(&mut self, text: String) -> Vec<StreamSignal<Bytes>> {
        if text.is_empty() {
            return Vec::new();
        }
        if let Some(on_parse) = self.on_parse.as_mut() {
            on_parse(&text);
        }
        vec![StreamSignal::Data(Bytes::from(text))]
    }
}

impl Stage for CallbackTap {
    type Input = Bytes;
    type Output = Bytes;

    fn transform(&mut self, input: Bytes) -> Vec<StreamSignal<Bytes>> {
        let text = self.decoder.decode(&input);
        self.emit(text)
    }

    fn finish(&mut self) -> Vec<StreamSignal<Bytes>> {
        let text = self.decoder.finish();
        self.emit(text)
    }
}

/// Final output of a pipeline: UTF-8 text chunks plus a completion hook.
///
/// The hook fires exactly once, when the stream ends, fails, or is dropped
/// before reaching the end.
pub struct TextStream {
    inner: Pipeline<Bytes>,
    on_done: Option<DoneHook>,
    closed: bool,
}

impl TextStream {
    pub fn new(inner: Pipeline<Bytes>, on_done: Option<DoneHook>) -> Self {
        Self {
            inner,
            on_done,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads the stream to the end and concatenates every chunk.
    pub async fn collect_text(mut self) -> Result<String, PixyStreamError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk?));
        }
        Ok(text)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(on_done) = self.on_done.take() {
            debug!("text stream closed");
            on_done();
        }
    }
}

impl Stream for TextStream {
    type Item = Result<Bytes, PixyStreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(error))) => {
                self.close();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for TextStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStream")
            .field("closed", &self.closed)
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        self.close();
    }
}
