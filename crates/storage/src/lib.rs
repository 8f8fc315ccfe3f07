pub mod error;
pub mod ids;
pub mod memory;
pub mod types;

use anywhere_llm::ContinuationState;

pub use error::{StorageError, StorageResult};
pub use ids::{AttachmentId, MessageId, SessionId};
pub use memory::MemorySessionStore;
pub use types::{
    Attachment, DEFAULT_SESSION_NAME, Message, MessageLog, Role, STOPPED_MARKER, Session,
    SessionSummary,
};

/// Owner of every chat session and of the "active session" pointer.
///
/// Readers (the presentation layer) only call the accessors; all mutation is issued by
/// the conversation orchestrator.
pub trait SessionStore: Send + Sync {
    /// Appends a session with an empty log; the active session is left unchanged.
    fn create_session(&self, name: &str) -> StorageResult<Session>;
    fn list_sessions(&self) -> StorageResult<Vec<SessionSummary>>;
    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<Session>>;
    fn active_session(&self) -> Option<SessionId>;
    fn set_active(&self, session_id: SessionId) -> StorageResult<()>;
    fn messages(&self, session_id: SessionId) -> StorageResult<MessageLog>;
    fn continuation_state(&self, session_id: SessionId) -> StorageResult<ContinuationState>;
    /// Appends one message and returns its index in the log.
    fn commit_message(&self, session_id: SessionId, message: Message) -> StorageResult<usize>;
    /// Installs a whole log at once; concurrent readers see the old or the new log.
    fn replace_log(&self, session_id: SessionId, log: Vec<Message>) -> StorageResult<()>;
    fn update_continuation_state(
        &self,
        session_id: SessionId,
        state: ContinuationState,
    ) -> StorageResult<()>;
}
