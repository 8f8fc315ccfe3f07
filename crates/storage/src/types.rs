use std::sync::Arc;

use anywhere_llm::ContinuationState;

use super::ids::{AttachmentId, MessageId, SessionId};

/// Name given to the first session and used as the prefix for later ones.
pub const DEFAULT_SESSION_NAME: &str = "New Chat";

/// Suffix rendered after an assistant reply whose generation was cancelled.
pub const STOPPED_MARKER: &str = " [stopped]";

/// Ordered message log as shared with readers; never mutated in place.
pub type MessageLog = Arc<Vec<Message>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Captured image bytes plus display metadata.
///
/// Bytes are frozen at capture time so a retry resubmits exactly what was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: AttachmentId,
    pub bytes: Arc<[u8]>,
    pub display_name: String,
}

impl Attachment {
    pub fn new(bytes: impl Into<Arc<[u8]>>, display_name: impl Into<String>) -> Self {
        Self {
            id: AttachmentId::new_v7(),
            bytes: bytes.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub model_id: Option<String>,
    pub attachments: Vec<Attachment>,
    /// `false` only for assistant replies cut short by cancellation.
    pub terminated: bool,
    /// Synthetic notice standing in for a reply the service failed to produce.
    pub failed: bool,
    /// Continuation state that was sent with the request producing this reply.
    pub prior_continuation: Option<ContinuationState>,
}

impl Message {
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role: Role::User,
            text: text.into(),
            model_id: None,
            attachments,
            terminated: true,
            failed: false,
            prior_continuation: None,
        }
    }

    pub fn assistant(text: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role: Role::Assistant,
            text: text.into(),
            model_id: Some(model_id.into()),
            attachments: Vec::new(),
            terminated: true,
            failed: false,
            prior_continuation: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn truncated(mut self) -> Self {
        self.terminated = false;
        self
    }

    pub fn as_failure(mut self) -> Self {
        self.failed = true;
        self
    }

    pub fn with_prior_continuation(mut self, continuation: ContinuationState) -> Self {
        self.prior_continuation = Some(continuation);
        self
    }

    /// Copy with a new identity and the same user-authored content.
    pub fn replayed(&self) -> Self {
        Self {
            id: MessageId::new_v7(),
            ..self.clone()
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Text as shown in the transcript, including attachment and truncation markers.
    pub fn display_text(&self) -> String {
        match self.role {
            Role::User => match self.attachments.len() {
                0 => self.text.clone(),
                1 => format!("{} [1 image attached]", self.text),
                count => format!("{} [{count} images attached]", self.text),
            },
            Role::Assistant if !self.terminated => format!("{}{STOPPED_MARKER}", self.text),
            Role::Assistant => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub messages: MessageLog,
    pub continuation: ContinuationState,
}

impl Session {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub message_count: usize,
}
