//! # Wire Protocol
//!
//! JSON messages exchanged over the streaming WebSocket.
//!
//! ## Client → Server:
//! - Binary frames: raw f32 little-endian PCM (no header)
//! - Text frames: control envelope, e.g. `{"EOS": true}`
//!
//! ## Server → Client:
//! ```json
//! { "uid": "127.0.0.1:50312",
//!   "segments": [ { "id": "…uuid…", "type": "inprogress", "text": "hello", "completed": false } ],
//!   "status": "listening" }
//! ```
//! plus `{ "uid": …, "status": "error", "message": … }` for session failures.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Partial or final recognition result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    #[serde(rename = "inprogress")]
    Partial,
    #[serde(rename = "transcribed")]
    Final,
}

/// One recognition event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    id: Uuid,
    #[serde(rename = "type")]
    kind: SegmentKind,
    text: String,
    completed: bool,
}

impl TranscriptionSegment {
    pub fn partial(text: impl Into<String>) -> Self {
        Self::new(SegmentKind::Partial, text.into())
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self::new(SegmentKind::Final, text.into())
    }

    fn new(kind: SegmentKind, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            text,
            completed: kind == SegmentKind::Final,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Utterance still in progress
    Listening,
    /// Utterance finalized
    Transforming,
}

/// Envelope for server → client results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub uid: String,
    pub segments: Vec<TranscriptionSegment>,
    pub status: SessionStatus,
}

impl OutboundMessage {
    /// Wrap a single segment, deriving the status from its completion.
    pub fn single(uid: &str, segment: TranscriptionSegment) -> Self {
        let status = if segment.is_completed() {
            SessionStatus::Transforming
        } else {
            SessionStatus::Listening
        };
        Self {
            uid: uid.to_string(),
            segments: vec![segment],
            status,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Best-effort failure notice sent before a session closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub uid: String,
    pub status: String,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(uid: &str, message: impl Into<String>) -> Self {
        Self {
            uid: uid.to_string(),
            status: "error".to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decoded client control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    EndOfStream,
}

#[derive(Debug, Deserialize)]
struct ControlEnvelope {
    #[serde(rename = "EOS", default)]
    eos: bool,
}

/// Parse a text frame.
///
/// ## Returns:
/// - **Ok(Some(signal))**: a recognized control signal
/// - **Ok(None)**: valid JSON object carrying nothing the relay acts on
/// - **Err(e)**: not a JSON object (the caller logs and ignores it)
pub fn parse_control(text: &str) -> serde_json::Result<Option<ControlSignal>> {
    let envelope: ControlEnvelope = serde_json::from_str(text)?;
    Ok(envelope.eos.then_some(ControlSignal::EndOfStream))
}
