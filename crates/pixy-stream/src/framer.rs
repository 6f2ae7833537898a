use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, trace};

use crate::decoder::Utf8Decoder;
use crate::error::{ErrorKind, ErrorRecord, PixyStreamError};
use crate::pipeline::Stage;
use crate::types::{Frame, StreamMode, StreamSignal};

const DATA_FIELD: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const EVENT_BOUNDARY: &str = "\n\n";
const CRLF_EVENT_BOUNDARY: &str = "\r\n\r\n";
const MAX_PENDING_FRAGMENTS: usize = 16;

/// Splits a server-sent-event body into JSON frames.
///
/// Bytes are decoded incrementally and appended to one buffer; every complete
/// `\n\n`-terminated region is framed as soon as it is seen. A region that is
/// not yet valid JSON is held back and re-joined with the next region, so an
/// event split by a stray blank line is parsed once all of it has arrived.
/// Every suffix of the held fragments is tried, so one garbage fragment
/// cannot hide a later event.
#[derive(Debug)]
pub struct SseFramer {
    mode: StreamMode,
    decoder: Utf8Decoder,
    buffer: String,
    pending: Vec<String>,
    finished: bool,
}

impl SseFramer {
    pub fn new(mode: StreamMode) -> Self {
        Self {
            mode,
            decoder: Utf8Decoder::new(),
            buffer: String::new(),
            pending: Vec::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one network chunk and returns the signals it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamSignal> {
        if self.finished {
            return Vec::new();
        }
        let text = self.decoder.decode(chunk);
        self.buffer.push_str(&text);
        self.drain()
    }

    /// Flushes whatever is left once the source has ended.
    pub fn finish(&mut self) -> Vec<StreamSignal> {
        if self.finished {
            return Vec::new();
        }
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);

        let mut signals = self.drain();
        if self.finished {
            return signals;
        }

        let trailing = std::mem::take(&mut self.buffer);
        if !trailing.trim().is_empty() {
            match self.frame_region(&trailing) {
                Some(signal) => signals.push(signal),
                None => debug!(
                    bytes = trailing.len(),
                    "dropping unterminated trailing fragment at end of stream"
                ),
            }
        }
        if !self.pending.is_empty() {
            debug!(
                fragments = self.pending.len(),
                "dropping incomplete event payload at end of stream"
            );
            self.pending.clear();
        }
        self.finished = true;
        signals
    }

    fn drain(&mut self) -> Vec<StreamSignal> {
        let mut signals = Vec::new();
        loop {
            if starts_with_sentinel(&self.buffer) {
                self.terminate();
                signals.push(StreamSignal::Done);
                return signals;
            }

            let Some((index, boundary_len)) = find_boundary(&self.buffer) else {
                return signals;
            };
            let region = self.buffer[..index].to_string();
            self.buffer.drain(..index + boundary_len);

            if let Some(signal) = self.frame_region(&region) {
                let terminal = signal.is_terminal();
                signals.push(signal);
                if terminal {
                    self.terminate();
                    return signals;
                }
            }
        }
    }

    fn frame_region(&mut self, region: &str) -> Option<StreamSignal> {
        let region = region.trim_end_matches('\r');
        let payload = match classify_region(region) {
            Region::Skip => {
                trace!(region, "skipping non-data event");
                return None;
            }
            Region::Data(payload) => payload,
        };

        if is_sentinel(&payload) {
            return Some(StreamSignal::Done);
        }

        // Longest window first: a payload split across regions must be
        // rejoined before any suffix of it is tried alone.
        for start in 0..=self.pending.len() {
            let candidate = join_window(&self.pending[start..], &payload);
            if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
                if start > 0 {
                    debug!(
                        fragments = start,
                        "discarding unparsable fragments superseded by a complete event"
                    );
                }
                self.pending.clear();
                return Some(self.inspect(candidate.trim(), value));
            }
        }

        if self.pending.len() == MAX_PENDING_FRAGMENTS {
            let dropped = self.pending.remove(0);
            debug!(bytes = dropped.len(), "pending window full, dropping oldest fragment");
        }
        trace!(
            bytes = payload.len(),
            "event payload incomplete, waiting for more data"
        );
        self.pending.push(payload);
        None
    }

    fn inspect(&self, text: &str, value: Value) -> StreamSignal {
        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            return StreamSignal::Error(PixyStreamError::upstream(error));
        }

        let frame = Frame::new(text, value);
        let finish_reasons = frame
            .choices()
            .iter()
            .filter_map(|choice| choice.get("finish_reason").and_then(Value::as_str))
            .collect::<Vec<_>>();

        if finish_reasons.contains(&"stop") {
            debug!("finish_reason stop received, ending stream");
            return StreamSignal::Done;
        }
        if self.mode == StreamMode::Tokens && finish_reasons.contains(&"length") {
            return StreamSignal::Error(ErrorRecord::new(ErrorKind::MaxTokens).into());
        }

        trace!(frame = %frame.text, "framed event");
        StreamSignal::Data(frame)
    }

    fn terminate(&mut self) {
        self.finished = true;
        self.buffer.clear();
        self.pending.clear();
    }
}

impl Stage for SseFramer {
    type Input = Bytes;
    type Output = Frame;

    fn transform(&mut self, input: Bytes) -> Vec<StreamSignal<Frame>> {
        self.push(&input)
    }

    fn finish(&mut self) -> Vec<StreamSignal<Frame>> {
        SseFramer::finish(self)
    }
}

enum Region {
    Skip,
    Data(String),
}

fn classify_region(region: &str) -> Region {
    if !region.contains('\n') {
        if let Some(payload) = region.strip_prefix(DATA_FIELD) {
            return Region::Data(payload.to_string());
        }
    }

    let lines = region
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    if lines.is_empty() || lines.iter().all(|line| line.starts_with(':')) {
        return Region::Skip;
    }

    let data_lines = lines
        .iter()
        .filter_map(|line| line.strip_prefix(DATA_FIELD))
        .collect::<Vec<_>>();
    if !data_lines.is_empty() {
        return Region::Data(data_lines.join("\n"));
    }
    if lines.iter().all(|line| is_field_line(line)) {
        return Region::Skip;
    }

    // Continuation of an event split by a blank line.
    Region::Data(region.to_string())
}

fn join_window(fragments: &[String], payload: &str) -> String {
    let mut joined = String::new();
    for fragment in fragments {
        joined.push_str(fragment);
        joined.push_str(EVENT_BOUNDARY);
    }
    joined.push_str(payload);
    joined
}

fn is_field_line(line: &str) -> bool {
    line.starts_with(':')
        || ["event:", "id:", "retry:"]
            .iter()
            .any(|field| line.starts_with(field))
}

fn is_sentinel(payload: &str) -> bool {
    payload.trim_start().starts_with(DONE_SENTINEL)
}

fn starts_with_sentinel(buffer: &str) -> bool {
    let trimmed = buffer.trim_start();
    let payload = trimmed.strip_prefix(DATA_FIELD).unwrap_or(trimmed);
    is_sentinel(payload)
}

fn find_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer
        .find(EVENT_BOUNDARY)
        .map(|index| (index, EVENT_BOUNDARY.len()));
    let crlf = buffer
        .find(CRLF_EVENT_BOUNDARY)
        .map(|index| (index, CRLF_EVENT_BOUNDARY.len()));
    match (lf, crlf) {
        (Some(lf), Some(crlf)) => Some(if crlf.0 < lf.0 { crlf } else { lf }),
        (lf, crlf) => lf.or(crlf),
    }
}
