use serde_json::Value;
use tracing::warn;

use crate::{
    chat::DONE_PAYLOAD,
    sse::{LineBuffer, data_payload},
};

/// Where assistant text may live in a canonical chunk, in order of preference
const CONTENT_POINTERS: [&str; 3] = [
    "/choices/0/delta/content",
    "/choices/0/message/content",
    "/content",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Delta(String),
    Done,
}

/// Incremental decoder for the proxy's canonical stream
///
/// Knows nothing about provider formats: only `data:` lines carrying either
/// `[DONE]` or a `choices[0].delta.content` style chunk are understood.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    carry: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        self.lines.push(chunk);
        while !self.done {
            let Some(line) = self.lines.next_line() else {
                break;
            };
            self.decode_line(&line, &mut events);
        }
        events
    }

    /// Decode whatever is still buffered once the body has ended
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        if let Some(rest) = self.lines.take_remainder() {
            self.decode_line(&rest, &mut events);
        }
        if self.carry.take().is_some() {
            warn!("Discarding incomplete stream payload at end of response");
        }
        events
    }

    /// True once `[DONE]` has been seen
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<DecodedEvent>) {
        if let Some(fragment) = self.carry.take() {
            let combined = format!("{}{}", fragment, line);
            match serde_json::from_str::<Value>(&combined) {
                Ok(chunk) => {
                    self.emit(&chunk, events);
                    return;
                }
                Err(e) => warn!(error = %e, "Dropping stream payload that failed to parse after recombination"),
            }
        }

        let Some(payload) = data_payload(line) else {
            return;
        };

        if payload == DONE_PAYLOAD {
            self.done = true;
            events.push(DecodedEvent::Done);
            return;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(chunk) => self.emit(&chunk, events),
            Err(_) => self.carry = Some(payload.to_string()),
        }
    }

    fn emit(&self, chunk: &Value, events: &mut Vec<DecodedEvent>) {
        let text = CONTENT_POINTERS
            .iter()
            .filter_map(|pointer| chunk.pointer(pointer).and_then(Value::as_str))
            .find(|text| !text.is_empty());

        if let Some(text) = text {
            events.push(DecodedEvent::Delta(text.to_string()));
        }
    }
}
