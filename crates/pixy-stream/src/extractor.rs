use bytes::Bytes;
use serde_json::Value;

use crate::error::PixyStreamError;
use crate::pipeline::Stage;
use crate::types::{Frame, StreamMode, StreamSignal};

/// Reduces one framed event to the text handed to the caller.
///
/// `Ok(None)` means the event carries nothing worth emitting.
pub trait Extractor: Send {
    fn extract(
        &mut self,
        frame: &Frame,
        mode: StreamMode,
    ) -> Result<Option<String>, PixyStreamError>;
}

impl<F> Extractor for F
where
    F: FnMut(&Frame, StreamMode) -> Result<Option<String>, PixyStreamError> + Send,
{
    fn extract(
        &mut self,
        frame: &Frame,
        mode: StreamMode,
    ) -> Result<Option<String>, PixyStreamError> {
        self(frame, mode)
    }
}

/// Text completions: `choices[0].text` in token mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionTokens;

impl Extractor for CompletionTokens {
    fn extract(
        &mut self,
        frame: &Frame,
        mode: StreamMode,
    ) -> Result<Option<String>, PixyStreamError> {
        match mode {
            StreamMode::Tokens => Ok(first_choice(frame)
                .and_then(|choice| choice.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string)),
            StreamMode::Raw => Ok(Some(frame.text.clone())),
        }
    }
}

/// Chat completions: the delta content in token mode, the whole delta
/// object as JSON in raw mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatDeltas;

impl Extractor for ChatDeltas {
    fn extract(
        &mut self,
        frame: &Frame,
        mode: StreamMode,
    ) -> Result<Option<String>, PixyStreamError> {
        let delta = first_choice(frame).and_then(|choice| choice.get("delta"));
        match mode {
            StreamMode::Tokens => Ok(delta
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
                .map(str::to_string)),
            StreamMode::Raw => match delta {
                Some(delta) => Ok(Some(serde_json::to_string(delta)?)),
                None => Ok(None),
            },
        }
    }
}

/// Forwards every frame's JSON text untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrames;

impl Extractor for RawFrames {
    fn extract(
        &mut self,
        frame: &Frame,
        _mode: StreamMode,
    ) -> Result<Option<String>, PixyStreamError> {
        Ok(Some(frame.text.clone()))
    }
}

fn first_choice(frame: &Frame) -> Option<&Value> {
    frame.choices().first()
}

/// Runs an extractor as a pipeline stage, emitting UTF-8 bytes.
pub struct ExtractStage<E> {
    extractor: E,
    mode: StreamMode,
}

impl<E: Extractor> ExtractStage<E> {
    pub fn new(extractor: E, mode: StreamMode) -> Self {
        Self { extractor, mode }
    }
}

impl<E: Extractor> Stage for ExtractStage<E> {
    type Input = Frame;
    type Output = Bytes;

    fn transform(&mut self, frame: Frame) -> Vec<StreamSignal<Bytes>> {
        match self.extractor.extract(&frame, self.mode) {
            Ok(Some(text)) if !text.is_empty() => vec![StreamSignal::Data(Bytes::from(text))],
            Ok(_) => Vec::new(),
            Err(error) => vec![StreamSignal::Error(error)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Frame {
        Frame::new(value.to_string(), value)
    }

    #[test]
    fn completion_tokens_reads_choice_text() {
        let frame = frame(json!({"choices": [{"text": "Hello", "index": 0}]}));
        let mut extractor = CompletionTokens;

        assert_eq!(
            extractor.extract(&frame, StreamMode::Tokens).unwrap(),
            Some("Hello".to_string())
        );
        assert_eq!(
            extractor.extract(&frame, StreamMode::Raw).unwrap(),
            Some(frame.text.clone())
        );
    }

    #[test]
    fn chat_deltas_read_content_or_whole_delta() {
        let content = frame(json!({"choices": [{"delta": {"content": "Hi"}}]}));
        let role_only = frame(json!({"choices": [{"delta": {"role": "assistant"}}]}));
        let mut extractor = ChatDeltas;

        assert_eq!(
            extractor.extract(&content, StreamMode::Tokens).unwrap(),
            Some("Hi".to_string())
        );
        assert_eq!(
            extractor.extract(&role_only, StreamMode::Tokens).unwrap(),
            None
        );
        assert_eq!(
            extractor.extract(&role_only, StreamMode::Raw).unwrap(),
            Some("{\"role\":\"assistant\"}".to_string())
        );
    }

    #[test]
    fn extract_stage_drops_empty_text_and_surfaces_errors() {
        let mut stage = ExtractStage::new(ChatDeltas, StreamMode::Tokens);
        assert!(stage
            .transform(frame(json!({"choices": [{"delta": {"content": ""}}]})))
            .is_empty());

        let mut failing = ExtractStage::new(
            |_: &Frame, _: StreamMode| -> Result<Option<String>, PixyStreamError> {
                Err(PixyStreamError::Config("extractor failed".to_string()))
            },
            StreamMode::Tokens,
        );
        let signals = failing.transform(frame(json!({})));
        assert!(matches!(
            signals.as_slice(),
            [StreamSignal::Error(PixyStreamError::Config(_))]
        ));
    }
}
