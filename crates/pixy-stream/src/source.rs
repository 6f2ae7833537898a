use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{stream, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::PixyStreamError;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, PixyStreamError>> + Send>>;
pub type ChunkSender = mpsc::Sender<Result<Bytes, PixyStreamError>>;

/// A response body delivered chunk by chunk.
///
/// The transport style is fixed when the source is built: `Pull` wraps a
/// stream the consumer polls (an HTTP body), `Push` wraps a channel a
/// producer task writes into. Both are read through the same `Stream` impl.
pub enum ByteSource {
    Pull(ChunkStream),
    Push(mpsc::Receiver<Result<Bytes, PixyStreamError>>),
}

impl ByteSource {
    pub fn pull<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, PixyStreamError>> + Send + 'static,
    {
        ByteSource::Pull(Box::pin(stream))
    }

    /// Creates a push source and the sender that feeds it. The source ends
    /// once every sender is dropped.
    pub fn push(capacity: usize) -> (ChunkSender, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, ByteSource::Push(receiver))
    }

    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks = chunks
            .into_iter()
            .map(|chunk| Ok::<Bytes, PixyStreamError>(chunk.into()))
            .collect::<Vec<_>>();
        Self::pull(stream::iter(chunks))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes: Bytes = bytes.into();
        Self::from_chunks([bytes])
    }

    pub fn empty() -> Self {
        Self::pull(stream::empty())
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        Self::pull(response.bytes_stream().map(|chunk| {
            chunk.map_err(|error| {
                PixyStreamError::Transport(format!("response body read failed: {error}"))
            })
        }))
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, PixyStreamError>> {
        self.next().await
    }

    /// Reads the remaining body into one buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes, PixyStreamError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl Stream for ByteSource {
    type Item = Result<Bytes, PixyStreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            ByteSource::Pull(stream) => stream.as_mut().poll_next(cx),
            ByteSource::Push(receiver) => receiver.poll_recv(cx),
        }
    }
}

impl Debug for ByteSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteSource::Pull(_) => f.write_str("ByteSource::Pull"),
            ByteSource::Push(_) => f.write_str("ByteSource::Push"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pull_source_yields_chunks_in_order() {
        let mut source = ByteSource::from_chunks(["ab", "cd"]);
        assert_eq!(source.next_chunk().await.unwrap().unwrap(), "ab");
        assert_eq!(source.next_chunk().await.unwrap().unwrap(), "cd");
        assert!(source.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn push_source_ends_when_sender_drops() {
        let (sender, source) = ByteSource::push(4);
        tokio::spawn(async move {
            for chunk in ["data: ", "{}\n\n"] {
                if sender.send(Ok(Bytes::from(chunk))).await.is_err() {
                    return;
                }
            }
        });

        let body = source.read_to_end().await.expect("push body");
        assert_eq!(body, "data: {}\n\n");
    }

    #[tokio::test]
    async fn read_to_end_surfaces_transport_errors() {
        let source = ByteSource::pull(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(PixyStreamError::Transport("connection reset".to_string())),
        ]));

        let error = source.read_to_end().await.expect_err("error expected");
        assert!(matches!(error, PixyStreamError::Transport(_)));
    }
}
