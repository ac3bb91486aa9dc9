//! Streaming turn events.
//!
//! The executor yields incremental events to a [`TurnEmitter`]; transports
//! (WebSocket, voice providers) drain the channel.  Event names follow the
//! realtime wire protocol, ordered per response:
//! `response.created`, `audio_transcript.delta*`, `audio_transcript.done`,
//! `audio.delta*`, `audio.done`, `tool-status*`, `response.done`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatusKind {
    Running,
    Completed,
    Failed,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "response.created")]
    ResponseCreated { track_id: String },
    #[serde(rename = "audio_transcript.delta")]
    TranscriptDelta { track_id: String, delta: String },
    #[serde(rename = "audio_transcript.done")]
    TranscriptDone { track_id: String, text: String },
    /// Audio passthrough from a voice provider; base64 payload.
    #[serde(rename = "audio.delta")]
    AudioDelta { track_id: String, data: String },
    #[serde(rename = "audio.done")]
    AudioDone { track_id: String },
    #[serde(rename = "tool-status")]
    ToolStatus {
        name: String,
        status: ToolStatusKind,
        message: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone { track_id: String, cancelled: bool },
}

/// Best-effort event sink.  A closed or absent receiver never fails the
/// turn; events are simply dropped.
#[derive(Clone, Default)]
pub struct TurnEmitter {
    tx: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl TurnEmitter {
    /// Emitter that discards everything; used by non-streaming callers.
    pub fn sink() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: TurnEvent) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn transcript_delta(&self, track_id: &str, delta: &str) {
        self.emit(TurnEvent::TranscriptDelta {
            track_id: track_id.to_string(),
            delta: delta.to_string(),
        });
    }

    pub fn tool_status(&self, name: &str, status: ToolStatusKind, message: &str) {
        self.emit(TurnEvent::ToolStatus {
            name: name.to_string(),
            status,
            message: message.to_string(),
        });
    }
}
