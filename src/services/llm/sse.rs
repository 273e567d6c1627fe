//! Server-Sent Events framing shared by the streaming providers.
//!
//! Network chunks do not line up with SSE events: one chunk may carry several events and an
//! event (or a multi-byte character) may be split across chunks. Bytes are buffered until a
//! full line is available.
//!
//! Every vendor marks a complete answer: `[DONE]`, a finish reason, or a stop event. A byte
//! stream that closes before that marker is reported as an error, never as a finished answer.

use futures::StreamExt;
use log::warn;
use reqwest::Response;

use super::TextStream;
use crate::services::error::GatewayError;

/// A parsed SSE line of interest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the prefix stripped
    Data(String),
    /// The OpenAI-style `[DONE]` terminator
    Done,
}

/// What a provider makes of one `data:` payload
#[derive(Debug)]
pub enum SseAction {
    Delta(String),
    /// Final text of a payload that also marks the answer complete
    Last(String),
    Skip,
    Finish,
    Fail(GatewayError),
}

#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the events completed by it
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the byte stream has ended
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest)).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    // event:, id:, retry: and comment lines carry nothing we need
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent::Data(data.to_string()))
}

enum Step {
    Emit(String),
    Continue,
    Finish(Option<String>),
    Fail(GatewayError),
}

fn step<F>(parse: &F, event: SseEvent) -> Step
where
    F: Fn(&str) -> SseAction,
{
    match event {
        SseEvent::Done => Step::Finish(None),
        SseEvent::Data(payload) => match parse(&payload) {
            SseAction::Delta(text) if text.is_empty() => Step::Continue,
            SseAction::Delta(text) => Step::Emit(text),
            SseAction::Last(text) => Step::Finish(Some(text).filter(|t| !t.is_empty())),
            SseAction::Skip => Step::Continue,
            SseAction::Finish => Step::Finish(None),
            SseAction::Fail(e) => Step::Fail(e),
        },
    }
}

/// Turn a streaming HTTP response into text deltas using a provider-specific payload parser
pub fn text_stream<F>(provider: String, response: Response, parse: F) -> TextStream
where
    F: Fn(&str) -> SseAction + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = SseLineBuffer::new();
        let mut finished = false;

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let error = GatewayError::transport(&provider, e);
                    warn!("{} stream interrupted: {}", provider, error);
                    yield Err(error);
                    return;
                }
            };
            for event in buffer.feed(&chunk) {
                match step(&parse, event) {
                    Step::Emit(text) => yield Ok(text),
                    Step::Continue => {}
                    Step::Finish(last) => {
                        if let Some(text) = last {
                            yield Ok(text);
                        }
                        finished = true;
                        break 'read;
                    }
                    Step::Fail(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if !finished {
            for event in buffer.flush() {
                match step(&parse, event) {
                    Step::Emit(text) => yield Ok(text),
                    Step::Continue => {}
                    Step::Finish(last) => {
                        if let Some(text) = last {
                            yield Ok(text);
                        }
                        finished = true;
                        break;
                    }
                    Step::Fail(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if !finished {
            warn!("{} stream closed before the answer was complete", provider);
            yield Err(GatewayError::response(&provider, "stream ended before completion"));
        }
    })
}
