use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use pixy_stream::{
    text_stream, ByteSource, ChatDeltas, CompletionTokens, ErrorKind, PixyStreamError,
    RawFrames, StreamMode,
};

const RECORDED_CHAT: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Stream\"}}]}\n\n\
: keep-alive\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"ed ✓\"}}]}\n\n\
data: [DONE]\n\n";

fn replay(body: &'static str, chunk_size: usize) -> ByteSource {
    let (sender, source) = ByteSource::push(2);
    tokio::spawn(async move {
        for piece in body.as_bytes().chunks(chunk_size) {
            if sender.send(Ok(Bytes::copy_from_slice(piece))).await.is_err() {
                return;
            }
        }
    });
    source
}

#[tokio::test]
async fn replayed_body_gives_same_text_for_every_chunk_size() {
    for chunk_size in [1, 2, 3, 5, 8, 13, RECORDED_CHAT.len()] {
        let text = text_stream(
            replay(RECORDED_CHAT, chunk_size),
            ChatDeltas,
            StreamMode::Tokens,
            None,
            None,
        )
        .collect_text()
        .await
        .expect("replay completes");

        assert_eq!(text, "Streamed ✓", "chunk size {chunk_size}");
    }
}

#[tokio::test]
async fn raw_mode_replay_forwards_deltas_as_json() {
    let text = text_stream(
        replay(RECORDED_CHAT, 4),
        ChatDeltas,
        StreamMode::Raw,
        None,
        None,
    )
    .collect_text()
    .await
    .expect("replay completes");

    assert_eq!(
        text,
        "{\"role\":\"assistant\"}{\"content\":\"Stream\"}{\"content\":\"ed ✓\"}"
    );
}

#[tokio::test]
async fn producer_error_terminates_stream_and_closes_once() {
    let (sender, source) = ByteSource::push(4);
    tokio::spawn(async move {
        let _ = sender
            .send(Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"text\":\"one\"}]}\n\n",
            )))
            .await;
        let _ = sender
            .send(Err(PixyStreamError::Transport("socket closed".to_string())))
            .await;
    });
    let done = Arc::new(AtomicUsize::new(0));
    let done_hook = Arc::clone(&done);

    let items = text_stream(
        source,
        CompletionTokens,
        StreamMode::Tokens,
        None,
        Some(Box::new(move || {
            done_hook.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .collect::<Vec<_>>()
    .await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().expect("first token"), "one");
    assert!(matches!(items[1], Err(PixyStreamError::Transport(_))));
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_consumer_early_releases_producer() {
    let (sender, source) = ByteSource::push(1);
    let producer = tokio::spawn(async move {
        let mut sent = 0usize;
        loop {
            let chunk = Bytes::from_static(b"data: {\"choices\":[{\"text\":\"x\"}]}\n\n");
            if sender.send(Ok(chunk)).await.is_err() {
                return sent;
            }
            sent += 1;
        }
    });
    let done = Arc::new(AtomicUsize::new(0));
    let done_hook = Arc::clone(&done);

    let mut stream = text_stream(
        source,
        RawFrames,
        StreamMode::Tokens,
        None,
        Some(Box::new(move || {
            done_hook.fetch_add(1, Ordering::SeqCst);
        })),
    );
    assert!(stream.next().await.is_some());
    drop(stream);

    let sent = producer.await.expect("producer task");
    assert!(sent >= 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn length_finish_reports_max_tokens_record() {
    let body = "data: {\"choices\":[{\"text\":\"cut\",\"finish_reason\":\"length\"}]}\n\n";
    let error = text_stream(replay(body, 9), CompletionTokens, StreamMode::Tokens, None, None)
        .collect_text()
        .await
        .expect_err("token limit");

    assert_eq!(error.kind(), ErrorKind::MaxTokens);
    assert!(error.to_string().starts_with("MaxTokens: "));
}
