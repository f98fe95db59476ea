//! Wire format of the generation event stream.
//!
//! The body is a sequence of newline-terminated lines. Only lines carrying the
//! `data:` prefix are meaningful; each holds either a small JSON envelope or the
//! `[DONE]` end marker.

use serde::Deserialize;
use structura_storage::MessageId;

pub const EVENT_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// One event payload. Unknown fields are ignored, missing ones are absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct StreamEnvelope {
    #[serde(default)]
    pub user_message_id: Option<MessageId>,
    #[serde(default)]
    pub assistant_message_id: Option<MessageId>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Incremental change carried by the stream, in the order it must be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    UserMessageId(MessageId),
    AssistantMessageId(MessageId),
    Content(String),
}

impl StreamEnvelope {
    pub fn into_updates(self) -> Vec<StreamUpdate> {
        let mut updates = Vec::with_capacity(3);
        if let Some(id) = self.user_message_id {
            updates.push(StreamUpdate::UserMessageId(id));
        }
        if let Some(id) = self.assistant_message_id {
            updates.push(StreamUpdate::AssistantMessageId(id));
        }
        if let Some(content) = self.content.filter(|content| !content.is_empty()) {
            updates.push(StreamUpdate::Content(content));
        }
        updates
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Ignored,
    Done,
    Event(StreamEnvelope),
    Malformed { payload: String, error: String },
}

pub fn parse_line(line: &str) -> StreamLine {
    let Some(payload) = line.strip_prefix(EVENT_PREFIX) else {
        return StreamLine::Ignored;
    };

    let payload = payload.trim();
    if payload.is_empty() {
        return StreamLine::Ignored;
    }
    if payload == DONE_SENTINEL {
        return StreamLine::Done;
    }

    match serde_json::from_str::<StreamEnvelope>(payload) {
        Ok(envelope) => StreamLine::Event(envelope),
        Err(error) => StreamLine::Malformed {
            payload: payload.to_string(),
            error: error.to_string(),
        },
    }
}

/// Reassembles lines that a transport read may have split.
///
/// Buffers raw bytes so a multi-byte character cut across reads is decoded intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw = self.pending.drain(..=newline).collect::<Vec<_>>();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Returns the trailing unterminated line, if any, at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
