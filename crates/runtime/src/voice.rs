//! Voice provider contract.
//!
//! Concrete realtime STT+TTS providers live outside the core; this module
//! fixes the interface they implement and the half-duplex session state
//! machine both sides share.  While the assistant is speaking, inbound
//! mic audio is gated; a client interrupt cancels the current response
//! and resets the playing flag.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use anima_llm::{ChatMessage, ChatRole};

/// Connection parameters handed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConnectConfig {
    pub entity_id: Uuid,
    pub user_name: String,
    pub user_info: String,
    pub voice_id: String,
    pub voice_provider_instructions: String,
}

/// Session context a provider requests on connect and refreshes
/// periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySessionContext {
    pub entity_name: String,
    pub identity: String,
    pub continuity_context: String,
    pub use_memory: bool,
}

/// Events a provider emits toward the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum VoiceEvent {
    Transcript { text: String, is_final: bool },
    Audio { data: String, sample_rate: u32, track_id: Option<String> },
    TrackStart { track_id: String, text: String },
    TrackComplete { track_id: String },
    ToolStatus { name: String, status: String, message: String },
    Media { url: String, kind: String },
    Error { message: String },
}

#[async_trait]
pub trait VoiceProvider: Send + Sync {
    async fn connect(&self, config: VoiceConnectConfig) -> Result<()>;
    /// Inbound mic audio.  Ignored while the assistant is speaking
    /// (half-duplex gate).
    async fn send_audio(&self, chunk: &[u8]) -> Result<()>;
    async fn send_text(&self, text: &str) -> Result<()>;
    /// Cancel the current response and reset the audio-playing flag.
    async fn interrupt(&self) -> Result<()>;
}

// ── Session state machine ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceSessionPhase {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
}

/// Transitions are driven by server-VAD events and client
/// playback-complete acknowledgements.
#[derive(Debug, Default)]
pub struct VoiceSessionState {
    phase: VoiceSessionPhase,
}

impl VoiceSessionState {
    pub fn phase(&self) -> VoiceSessionPhase {
        self.phase
    }

    /// Whether inbound mic audio should be accepted right now.
    pub fn accepts_audio(&self) -> bool {
        self.phase != VoiceSessionPhase::Speaking
    }

    /// Server VAD detected speech start.
    pub fn speech_started(&mut self) {
        if self.phase != VoiceSessionPhase::Speaking {
            self.phase = VoiceSessionPhase::Listening;
        }
    }

    /// Server VAD detected end of the user's utterance.
    pub fn speech_ended(&mut self) {
        if self.phase == VoiceSessionPhase::Listening {
            self.phase = VoiceSessionPhase::Processing;
        }
    }

    /// The assistant started producing audio.
    pub fn response_started(&mut self) {
        self.phase = VoiceSessionPhase::Speaking;
    }

    /// Client acknowledged playback completion.
    pub fn playback_complete(&mut self) {
        if self.phase == VoiceSessionPhase::Speaking {
            self.phase = VoiceSessionPhase::Idle;
        }
    }

    /// Client interrupt: cancel the response, go straight to listening.
    pub fn interrupted(&mut self) {
        self.phase = VoiceSessionPhase::Listening;
    }
}

// ── Session context refresh cadence ──────────────────────────────────────────

/// Providers re-request session context roughly every two minutes or
/// every ten turns, whichever comes first.
const REFRESH_INTERVAL_SECS: i64 = 120;
const REFRESH_TURN_LIMIT: u32 = 10;

#[derive(Debug)]
pub struct SessionContextRefresh {
    last_refresh: DateTime<Utc>,
    turns_since: u32,
}

impl SessionContextRefresh {
    pub fn new() -> Self {
        Self { last_refresh: Utc::now(), turns_since: 0 }
    }

    pub fn record_turn(&mut self) {
        self.turns_since += 1;
    }

    pub fn should_refresh(&self) -> bool {
        self.turns_since >= REFRESH_TURN_LIMIT
            || Utc::now() - self.last_refresh > Duration::seconds(REFRESH_INTERVAL_SECS)
    }

    pub fn mark_refreshed(&mut self) {
        self.last_refresh = Utc::now();
        self.turns_since = 0;
    }
}

impl Default for SessionContextRefresh {
    fn default() -> Self {
        Self::new()
    }
}

// ── cortex_query ─────────────────────────────────────────────────────────────

/// Drop instruction-bearing messages from a provider-side history.
pub(crate) fn filter_instruction_messages(history: &[ChatMessage]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter(|m| {
            m.role != ChatRole::System
                && !m
                    .content
                    .as_deref()
                    .is_some_and(|c| c.trim_start().starts_with("<INSTRUCTIONS>"))
        })
        .cloned()
        .collect()
}

/// Prepare a provider-side history for a `cortex_query` callback into the
/// entity agent: instruction-bearing messages are dropped and the
/// synthetic query becomes the last user turn.
pub fn filter_history_for_query(history: &[ChatMessage], query: &str) -> Vec<ChatMessage> {
    let mut filtered = filter_instruction_messages(history);
    filtered.push(ChatMessage::user(query));
    filtered
}

/// Parse a wire-shaped history array (`[{role, content}, …]`) into chat
/// messages.  Unknown roles and non-string content are skipped.
pub(crate) fn history_from_wire(value: &serde_json::Value) -> Vec<ChatMessage> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let content = item.get("content")?.as_str()?;
            match item.get("role")?.as_str()? {
                "system" => Some(ChatMessage::system(content)),
                "user" => Some(ChatMessage::user(content)),
                "assistant" => Some(ChatMessage::assistant(content)),
                _ => None,
            }
        })
        .collect()
}

/// The pathway a voice provider's `cortex_query` tool invokes: it filters
/// the provider's history and delegates to the entity agent with the
/// synthetic query as the latest user turn.
pub const CORTEX_QUERY_PATHWAY: &str = "cortex_query";

pub struct CortexQueryPathway;

#[async_trait]
impl anima_pathway::PathwayExecutor for CortexQueryPathway {
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: anima_pathway::PathwayContext,
    ) -> Result<anima_pathway::PathwayInvocation> {
        let query = args
            .get("query")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| crate::RuntimeError::Validation("cortex_query requires a query".to_string()))?
            .to_string();
        let history = args
            .get("history")
            .map(history_from_wire)
            .unwrap_or_default();
        let filtered = filter_instruction_messages(&history);

        let forwarded = serde_json::json!({
            "query": query,
            "voice": true,
            "history": filtered
                .iter()
                .map(|m| serde_json::json!({
                    "role": match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                        ChatRole::Tool => "tool",
                    },
                    "content": m.content,
                }))
                .collect::<Vec<_>>(),
        });
        let registry = ctx.registry.clone();
        registry
            .invoke(crate::agent::ENTITY_AGENT_PATHWAY, forwarded, ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mic_is_gated_while_speaking() {
        let mut state = VoiceSessionState::default();
        assert!(state.accepts_audio());

        state.speech_started();
        state.speech_ended();
        state.response_started();
        assert_eq!(state.phase(), VoiceSessionPhase::Speaking);
        assert!(!state.accepts_audio());

        state.playback_complete();
        assert_eq!(state.phase(), VoiceSessionPhase::Idle);
        assert!(state.accepts_audio());
    }

    #[test]
    fn interrupt_resets_to_listening() {
        let mut state = VoiceSessionState::default();
        state.response_started();
        state.interrupted();
        assert_eq!(state.phase(), VoiceSessionPhase::Listening);
        assert!(state.accepts_audio());
    }

    #[test]
    fn vad_start_does_not_preempt_speaking() {
        let mut state = VoiceSessionState::default();
        state.response_started();
        state.speech_started();
        assert_eq!(state.phase(), VoiceSessionPhase::Speaking);
    }

    #[test]
    fn refresh_cadence_counts_turns() {
        let mut refresh = SessionContextRefresh::new();
        assert!(!refresh.should_refresh());
        for _ in 0..10 {
            refresh.record_turn();
        }
        assert!(refresh.should_refresh());
        refresh.mark_refreshed();
        assert!(!refresh.should_refresh());
    }

    #[test]
    fn query_filter_drops_instruction_messages() {
        let history = vec![
            ChatMessage::system("be nice"),
            ChatMessage::user("<INSTRUCTIONS>internal steering</INSTRUCTIONS>"),
            ChatMessage::user("what's the weather"),
            ChatMessage::assistant("sunny"),
        ];
        let filtered = filter_history_for_query(&history, "and tomorrow?");
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered[0].content.as_deref(), Some("what's the weather"));
        assert_eq!(filtered.last().unwrap().content.as_deref(), Some("and tomorrow?"));
    }

    #[test]
    fn voice_events_serialize_kebab_case() {
        let event = VoiceEvent::TrackStart { track_id: "t".into(), text: "hi".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "track-start");
    }
}
