//! Sample codec and Server-Sent-Events framing
//!
//! The push endpoint delivers samples as an event stream:
//! ```text
//! data: {"speed":8.5,"incline":1.0,...}\n
//! \n
//! ```
//!
//! `SseDecoder` reassembles events from arbitrary byte chunks, `decode_sample`
//! turns an event payload (or a pull response body) into a [`Sample`].

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::{now_iso, Sample};

/// Maximum size of a single undispatched event (1 MB) to prevent memory exhaustion
pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Event too large: {0} bytes (max: {MAX_EVENT_SIZE})")]
    EventTooLarge(usize),

    #[error("Invalid sample payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a JSON sample, stamping it with the current time when the producer omitted one
pub fn decode_sample(payload: &str) -> Result<Sample, CodecError> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WireSample {
        speed: f64,
        incline: f64,
        distance: f64,
        calories: f64,
        #[serde(default)]
        heart_rate: Option<f64>,
        #[serde(default)]
        cadence: Option<f64>,
        #[serde(default)]
        steps: Option<f64>,
        #[serde(default)]
        timestamp: Option<String>,
    }

    let wire: WireSample = serde_json::from_str(payload)?;

    let timestamp = wire
        .timestamp
        .filter(|ts| !ts.trim().is_empty())
        .unwrap_or_else(now_iso);

    Ok(Sample {
        speed: wire.speed,
        incline: wire.incline,
        distance: wire.distance,
        calories: wire.calories,
        heart_rate: wire.heart_rate,
        cadence: wire.cadence,
        steps: wire.steps,
        timestamp,
    })
}

/// Encode a sample as JSON
pub fn encode_sample(sample: &Sample) -> Result<String, CodecError> {
    Ok(serde_json::to_string(sample)?)
}

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// `event:` field, `None` for unnamed events
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`
    pub data: String,
    /// `id:` field
    pub id: Option<String>,
    /// `retry:` field (milliseconds)
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Whether this event would reach an `onmessage` listener
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Decoder state machine for streaming event-stream decoding
#[derive(Debug)]
pub struct SseDecoder {
    /// Raw bytes not yet split into lines
    buffer: BytesMut,
    /// Fields of the event being assembled
    pending: SseEvent,
    /// Whether at least one `data:` line was seen for `pending`
    has_data: bool,
    /// Whether the stream start (and a possible BOM) was handled
    started: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Create a new event decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            pending: SseEvent::default(),
            has_data: false,
            started: false,
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next dispatched event from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete events
    pub fn decode_next(&mut self) -> Result<Option<SseEvent>, CodecError> {
        loop {
            if !self.started {
                if self.buffer.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&self.buffer) {
                    return Ok(None);
                }
                if self.buffer.starts_with(UTF8_BOM) {
                    self.buffer.advance(UTF8_BOM.len());
                }
                self.started = true;
            }

            let Some(line) = self.next_line() else {
                let size = self.buffer.len() + self.pending.data.len();
                if size > MAX_EVENT_SIZE {
                    self.reset();
                    return Err(CodecError::EventTooLarge(size));
                }
                return Ok(None);
            };

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    return Ok(Some(event));
                }
                continue;
            }

            self.process_line(&line);

            if self.pending.data.len() > MAX_EVENT_SIZE {
                let size = self.pending.data.len();
                self.reset();
                return Err(CodecError::EventTooLarge(size));
            }
        }
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Split one line off the buffer, accepting `\n`, `\r\n` and `\r` terminators
    fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n' || b == b'\r')?;

        let terminator_len = if self.buffer[end] == b'\r' {
            match self.buffer.get(end + 1) {
                Some(b'\n') => 2,
                Some(_) => 1,
                // A trailing \r may be the first half of \r\n
                None => return None,
            }
        } else {
            1
        };

        let line = self.buffer.split_to(end);
        self.buffer.advance(terminator_len);

        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.pending.id = Some(value.to_string()),
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    self.pending.retry = value.parse().ok();
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let has_data = std::mem::take(&mut self.has_data);
        let event = std::mem::take(&mut self.pending);
        has_data.then_some(event)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.pending = SseEvent::default();
        self.has_data = false;
    }
}
