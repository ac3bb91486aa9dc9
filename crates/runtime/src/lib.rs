//! Turn execution: the tool-calling loop, streaming surface, and the
//! entity agent pathway that composes continuity memory, the pathway
//! registry, and the model endpoints into a single turn.

use thiserror::Error;

mod agent;
mod emitter;
mod executor;
mod voice;

pub use agent::{AgentTurnParams, AgentTurnResult, EntityAgentPathway, ENTITY_AGENT_PATHWAY};
pub use emitter::{ToolStatusKind, TurnEmitter, TurnEvent};
pub use executor::{ToolUseRecord, TurnExecutor, TurnOutcome, TurnRequest};
pub use voice::{
    CORTEX_QUERY_PATHWAY, CortexQueryPathway, EntitySessionContext, SessionContextRefresh,
    VoiceConnectConfig, VoiceEvent, VoiceProvider, VoiceSessionPhase, VoiceSessionState,
    filter_history_for_query,
};

/// Error kinds the runtime distinguishes.  Configuration errors abort the
/// turn; not-found and validation surface as structured errors to the
/// caller, never thrown into tool loops; remote failures become
/// machine-readable tool payloads the model can adapt to.  Cancellation
/// is not an error: the executor returns a partial [`TurnOutcome`] with
/// `cancelled = true`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Render any error as its runtime kind, wrapping unclassified ones
    /// as `Internal`.
    pub fn describe(err: &anyhow::Error) -> String {
        match err.downcast_ref::<RuntimeError>() {
            Some(kind) => kind.to_string(),
            None => Self::Internal(err.to_string()).to_string(),
        }
    }
}
