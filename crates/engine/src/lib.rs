#![deny(unsafe_code)]

//! Conversation engine: turn orchestration, streaming, history edits and attachment
//! transport on top of a generation service and a session store.

pub mod codec;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod settings;
pub mod stream;

pub use error::{EngineError, EngineResult};
pub use history::{RetrySplice, SpliceError, append_turn, preceding_user_index, splice_retry};
pub use orchestrator::{ConversationOrchestrator, SkipReason, TurnOutcome, TurnReport, TurnStatus};
pub use settings::{EngineSettings, RetryContinuation, SettingsError, SettingsStore};
pub use stream::{
    StreamController, StreamHandle, StreamOptions, StreamOutcome, StreamPhase, StreamTransition,
    StreamTransitionRejection,
};
