//! Turn coordination: validation, history edits, streaming and settlement.
//!
//! One orchestrator serves every session. Each session owns at most one stream slot at a
//! time; streams of different sessions run concurrently and settle independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anywhere_llm::{
    ContinuationState, GenerateRequest, GenerationError, GenerationService, Model, ModelCatalog,
    WorkerAbortedSnafu,
};
use anywhere_storage::{
    Attachment, AttachmentId, Message, MessageLog, Session, SessionId, SessionStore,
    SessionSummary,
};
use snafu::ResultExt;
use tokio::sync::watch;

use crate::codec;
use crate::error::{EngineResult, SettingsSnafu, StorageSnafu};
use crate::history;
use crate::settings::{EngineSettings, RetryContinuation, SettingsStore};
use crate::stream::{StreamController, StreamHandle, StreamOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoModelSelected,
    EmptyInput,
    NoActiveSession,
    StreamInFlight,
    InvalidRetryTarget,
}

#[derive(Debug, Clone)]
pub enum TurnStatus {
    Completed,
    Cancelled,
    Failed { error: GenerationError },
}

/// What a settled turn committed.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub session_id: SessionId,
    pub status: TurnStatus,
    pub reply: Message,
    pub reply_index: usize,
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// Validation failed; nothing was committed and no request was sent.
    Skipped(SkipReason),
    Settled(TurnReport),
}

impl TurnOutcome {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skipped(reason) => Some(*reason),
            Self::Settled(_) => None,
        }
    }

    pub fn report(&self) -> Option<&TurnReport> {
        match self {
            Self::Skipped(_) => None,
            Self::Settled(report) => Some(report),
        }
    }
}

struct ActiveStream {
    handle: StreamHandle,
    settling: bool,
}

#[derive(Default)]
struct OrchestratorState {
    selected_model: Option<String>,
    staged: HashMap<SessionId, Vec<Attachment>>,
    streams: HashMap<SessionId, ActiveStream>,
}

pub struct ConversationOrchestrator {
    service: Arc<dyn GenerationService>,
    store: Arc<dyn SessionStore>,
    settings: Arc<SettingsStore>,
    state: Mutex<OrchestratorState>,
}

impl ConversationOrchestrator {
    /// Builds an orchestrator and makes sure an active session exists.
    pub fn new(
        service: Arc<dyn GenerationService>,
        store: Arc<dyn SessionStore>,
        settings: Arc<SettingsStore>,
    ) -> EngineResult<Self> {
        let current = settings.settings();
        if store.active_session().is_none() {
            let sessions = store.list_sessions().context(StorageSnafu {
                stage: "orchestrator-list-sessions",
            })?;
            let session_id = match sessions.first() {
                Some(summary) => summary.id,
                None => {
                    store
                        .create_session(&current.default_session_name)
                        .context(StorageSnafu {
                            stage: "orchestrator-create-initial-session",
                        })?
                        .id
                }
            };
            store.set_active(session_id).context(StorageSnafu {
                stage: "orchestrator-activate-initial-session",
            })?;
        }

        Ok(Self {
            service,
            store,
            state: Mutex::new(OrchestratorState {
                selected_model: current.default_model.clone(),
                ..OrchestratorState::default()
            }),
            settings,
        })
    }

    pub fn with_settings(
        service: Arc<dyn GenerationService>,
        store: Arc<dyn SessionStore>,
        settings: EngineSettings,
    ) -> EngineResult<Self> {
        Self::new(service, store, Arc::new(SettingsStore::ephemeral(settings)))
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.settings()
    }

    pub fn update_settings(&self, settings: EngineSettings) -> EngineResult<()> {
        self.settings.update(settings).context(SettingsSnafu {
            stage: "orchestrator-update-settings",
        })
    }

    /// Lists models from the service, falling back to the configured default model when
    /// listing fails. Selects a model if none is selected yet.
    pub async fn refresh_models(&self) -> ModelCatalog {
        let settings = self.settings.settings();
        let catalog = match self.service.list_models().await {
            Ok(models) => ModelCatalog::from_service_api(models),
            Err(error) => {
                tracing::warn!(
                    service_id = %self.service.id(),
                    error = %error,
                    "failed to list models, using configured default"
                );
                let fallback = settings.default_model.iter().map(Model::from_id).collect();
                ModelCatalog::from_configured_fallback(fallback, error.to_string())
            }
        };

        let mut state = self.lock_state();
        if state.selected_model.is_none() {
            state.selected_model = settings
                .default_model
                .clone()
                .filter(|model_id| catalog.contains(model_id))
                .or_else(|| catalog.first_model_id().map(str::to_string));
        }
        catalog
    }

    pub fn select_model(&self, model_id: Option<String>) {
        self.lock_state().selected_model = model_id;
    }

    pub fn selected_model(&self) -> Option<String> {
        self.lock_state().selected_model.clone()
    }

    /// Stages an attachment for the next send in the active session.
    pub fn stage_attachment(&self, attachment: Attachment) {
        let Some(session_id) = self.store.active_session() else {
            tracing::warn!(attachment_id = %attachment.id, "no active session, attachment ignored");
            return;
        };
        self.lock_state()
            .staged
            .entry(session_id)
            .or_default()
            .push(attachment);
    }

    pub fn unstage_attachment(&self, attachment_id: AttachmentId) -> Option<Attachment> {
        let session_id = self.store.active_session()?;
        let mut state = self.lock_state();
        let staged = state.staged.get_mut(&session_id)?;
        let position = staged
            .iter()
            .position(|attachment| attachment.id == attachment_id)?;
        Some(staged.remove(position))
    }

    /// Attachments staged in the active session.
    pub fn staged_attachments(&self) -> Vec<Attachment> {
        let Some(session_id) = self.store.active_session() else {
            return Vec::new();
        };
        self.lock_state()
            .staged
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn create_session(&self, name: &str) -> EngineResult<Session> {
        self.store.create_session(name).context(StorageSnafu {
            stage: "orchestrator-create-session",
        })
    }

    /// Creates a session with the next default name and makes it active.
    pub fn new_session(&self) -> EngineResult<Session> {
        let base = self.settings.settings().default_session_name.clone();
        let count = self.sessions()?.len();
        let name = if count == 0 {
            base
        } else {
            format!("{base} {}", count + 1)
        };

        let session = self.create_session(&name)?;
        self.set_active_session(session.id)?;
        Ok(session)
    }

    pub fn set_active_session(&self, session_id: SessionId) -> EngineResult<()> {
        self.store.set_active(session_id).context(StorageSnafu {
            stage: "orchestrator-set-active-session",
        })
    }

    pub fn sessions(&self) -> EngineResult<Vec<SessionSummary>> {
        self.store.list_sessions().context(StorageSnafu {
            stage: "orchestrator-list-sessions",
        })
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.store.active_session()
    }

    pub fn messages(&self, session_id: SessionId) -> EngineResult<MessageLog> {
        self.store.messages(session_id).context(StorageSnafu {
            stage: "orchestrator-messages",
        })
    }

    pub fn active_messages(&self) -> EngineResult<MessageLog> {
        match self.store.active_session() {
            Some(session_id) => self.messages(session_id),
            None => Ok(Arc::new(Vec::new())),
        }
    }

    pub fn continuation_state(&self, session_id: SessionId) -> EngineResult<ContinuationState> {
        self.store
            .continuation_state(session_id)
            .context(StorageSnafu {
                stage: "orchestrator-continuation-state",
            })
    }

    /// Text streamed so far for the active session; `None` when nothing is streaming.
    pub fn in_progress_text(&self) -> Option<String> {
        let session_id = self.store.active_session()?;
        let state = self.lock_state();
        state
            .streams
            .get(&session_id)
            .filter(|stream| !stream.settling)
            .map(|stream| stream.handle.progress_text())
    }

    pub fn progress(&self, session_id: SessionId) -> Option<watch::Receiver<String>> {
        self.lock_state()
            .streams
            .get(&session_id)
            .map(|stream| stream.handle.subscribe())
    }

    pub fn is_generating(&self, session_id: SessionId) -> bool {
        self.lock_state().streams.contains_key(&session_id)
    }

    pub fn cancel_active_generation(&self) -> bool {
        match self.store.active_session() {
            Some(session_id) => self.cancel_generation(session_id),
            None => false,
        }
    }

    /// Requests cancellation of the session's stream; returns whether one was running.
    pub fn cancel_generation(&self, session_id: SessionId) -> bool {
        let state = self.lock_state();
        let Some(stream) = state.streams.get(&session_id) else {
            return false;
        };
        stream.handle.cancel();
        tracing::debug!(session_id = %session_id, "cancellation requested");
        true
    }

    pub async fn send_staged_turn(&self, text: &str) -> EngineResult<TurnOutcome> {
        let attachments = self.staged_attachments();
        self.send_turn(text, attachments).await
    }

    /// Commits a user message to the active session and streams the reply into it.
    pub async fn send_turn(
        &self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> EngineResult<TurnOutcome> {
        let Some(model_id) = self.selected_model() else {
            return Ok(skipped(SkipReason::NoModelSelected));
        };
        if text.trim().is_empty() && attachments.is_empty() {
            return Ok(skipped(SkipReason::EmptyInput));
        }
        let Some(session_id) = self.store.active_session() else {
            return Ok(skipped(SkipReason::NoActiveSession));
        };
        let Some((mut slot, controller)) = self.reserve(session_id) else {
            return Ok(skipped(SkipReason::StreamInFlight));
        };

        let user_message = Message::user(text, attachments).with_model(&model_id);
        self.store
            .commit_message(session_id, user_message.clone())
            .context(StorageSnafu {
                stage: "send-commit-user-message",
            })?;
        let continuation = self.continuation_state(session_id)?;
        slot.arm(&user_message, &model_id, continuation.clone());

        tracing::debug!(
            session_id = %session_id,
            model_id = %model_id,
            attachment_count = user_message.attachments.len(),
            "sending turn"
        );
        self.stream_turn(slot, controller, model_id, &user_message, continuation)
            .await
    }

    /// Removes a user message and its reply, re-appends the user message and streams a new
    /// reply for it.
    pub async fn retry_turn(
        &self,
        user_index: usize,
        assistant_index: Option<usize>,
    ) -> EngineResult<TurnOutcome> {
        let Some(model_id) = self.selected_model() else {
            return Ok(skipped(SkipReason::NoModelSelected));
        };
        let Some(session_id) = self.store.active_session() else {
            return Ok(skipped(SkipReason::NoActiveSession));
        };
        let Some((mut slot, controller)) = self.reserve(session_id) else {
            return Ok(skipped(SkipReason::StreamInFlight));
        };

        let log = self.messages(session_id)?;
        let splice = match history::splice_retry(&log, user_index, assistant_index) {
            Ok(splice) => splice,
            Err(error) => {
                tracing::debug!(session_id = %session_id, error = %error, "retry skipped");
                return Ok(skipped(SkipReason::InvalidRetryTarget));
            }
        };
        self.store
            .replace_log(session_id, splice.log)
            .context(StorageSnafu {
                stage: "retry-install-spliced-log",
            })?;
        self.lock_state()
            .staged
            .insert(session_id, splice.replayed.attachments.clone());

        let current = self.continuation_state(session_id)?;
        let continuation = match self.settings.settings().retry_continuation {
            RetryContinuation::Current => current,
            RetryContinuation::Rewind => splice
                .removed_reply
                .and_then(|reply| reply.prior_continuation)
                .unwrap_or(current),
        };
        slot.arm(&splice.replayed, &model_id, continuation.clone());

        tracing::debug!(
            session_id = %session_id,
            model_id = %model_id,
            user_index,
            assistant_index = ?assistant_index,
            "retrying turn"
        );
        self.stream_turn(slot, controller, model_id, &splice.replayed, continuation)
            .await
    }

    async fn stream_turn(
        &self,
        mut slot: TurnSlot<'_>,
        controller: StreamController,
        model_id: String,
        prompt: &Message,
        continuation: ContinuationState,
    ) -> EngineResult<TurnOutcome> {
        let request = GenerateRequest::new(&model_id, &prompt.text, continuation.clone())
            .with_images(codec::encode_all(&prompt.attachments));

        let outcome = match controller.start(self.service.clone(), request).await {
            Ok(outcome) => outcome,
            Err(join_error) => StreamOutcome::Failed {
                text: slot.handle.progress_text(),
                error: WorkerAbortedSnafu {
                    stage: "stream-join",
                    details: join_error.to_string(),
                }
                .build(),
            },
        };

        slot.begin_settling();
        let report = self.settle(slot.session_id, &model_id, continuation, outcome)?;
        Ok(TurnOutcome::Settled(report))
    }

    /// Commits exactly one assistant message for a finished stream.
    fn settle(
        &self,
        session_id: SessionId,
        model_id: &str,
        prior: ContinuationState,
        outcome: StreamOutcome,
    ) -> EngineResult<TurnReport> {
        let (reply, status, next_state) = match outcome {
            StreamOutcome::Completed { text, continuation } => (
                Message::assistant(text, model_id),
                TurnStatus::Completed,
                Some(continuation),
            ),
            StreamOutcome::Cancelled { text } => (
                Message::assistant(text, model_id).truncated(),
                TurnStatus::Cancelled,
                None,
            ),
            StreamOutcome::Failed { text, error } => {
                // Partial text is dropped; the notice stands in for the whole reply.
                tracing::warn!(
                    session_id = %session_id,
                    model_id = %model_id,
                    partial_len = text.len(),
                    error = %error,
                    "generation failed, committing failure notice"
                );
                let notice = self.settings.settings().failure_notice.clone();
                (
                    Message::assistant(notice, model_id).as_failure(),
                    TurnStatus::Failed { error },
                    None,
                )
            }
        };

        let reply = reply.with_prior_continuation(prior);
        let reply_index = self
            .store
            .commit_message(session_id, reply.clone())
            .context(StorageSnafu {
                stage: "settle-commit-reply",
            })?;
        // The state only moves after its reply is in the log.
        if let Some(state) = next_state {
            self.store
                .update_continuation_state(session_id, state)
                .context(StorageSnafu {
                    stage: "settle-update-continuation",
                })?;
        }

        tracing::info!(
            session_id = %session_id,
            model_id = %model_id,
            reply_index,
            status = ?status,
            "turn settled"
        );
        Ok(TurnReport {
            session_id,
            status,
            reply,
            reply_index,
        })
    }

    fn reserve(&self, session_id: SessionId) -> Option<(TurnSlot<'_>, StreamController)> {
        let options = self.settings.settings().stream_options();
        let mut state = self.lock_state();
        if state.streams.contains_key(&session_id) {
            tracing::debug!(session_id = %session_id, "stream already in flight");
            return None;
        }

        let (controller, handle) = StreamController::new(options);
        state.streams.insert(
            session_id,
            ActiveStream {
                handle: handle.clone(),
                settling: false,
            },
        );
        let slot = TurnSlot {
            orchestrator: self,
            session_id,
            handle,
            consumed: Vec::new(),
            pending: None,
        };
        Some((slot, controller))
    }

    fn lock_state(&self) -> MutexGuard<'_, OrchestratorState> {
        lock(&self.state)
    }
}

/// Reply owed to a session whose prompt is already in the log.
struct PendingReply {
    model_id: String,
    prior: ContinuationState,
}

/// Stream reservation for one session; released on drop whether the turn settled, failed
/// to commit, or was abandoned by the caller.
///
/// An armed slot dropped before settlement commits the streamed text as a stopped reply.
struct TurnSlot<'a> {
    orchestrator: &'a ConversationOrchestrator,
    session_id: SessionId,
    handle: StreamHandle,
    consumed: Vec<AttachmentId>,
    pending: Option<PendingReply>,
}

impl TurnSlot<'_> {
    fn arm(&mut self, prompt: &Message, model_id: &str, prior: ContinuationState) {
        self.consumed = prompt.attachments.iter().map(|attachment| attachment.id).collect();
        self.pending = Some(PendingReply {
            model_id: model_id.to_string(),
            prior,
        });
    }

    fn begin_settling(&mut self) {
        self.pending = None;
        if let Some(stream) = self
            .orchestrator
            .lock_state()
            .streams
            .get_mut(&self.session_id)
        {
            stream.settling = true;
        }
    }
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        self.handle.cancel();
        if let Some(pending) = self.pending.take() {
            let reply = Message::assistant(self.handle.progress_text(), pending.model_id)
                .truncated()
                .with_prior_continuation(pending.prior);
            match self.orchestrator.store.commit_message(self.session_id, reply) {
                Ok(reply_index) => tracing::info!(
                    session_id = %self.session_id,
                    reply_index,
                    "turn abandoned, partial reply committed"
                ),
                Err(error) => tracing::warn!(
                    session_id = %self.session_id,
                    error = %error,
                    "failed to commit reply of abandoned turn"
                ),
            }
        }

        let mut state = self.orchestrator.lock_state();
        state.streams.remove(&self.session_id);
        let emptied = match state.staged.get_mut(&self.session_id) {
            Some(staged) => {
                staged.retain(|attachment| !self.consumed.contains(&attachment.id));
                staged.is_empty()
            }
            None => false,
        };
        if emptied {
            state.staged.remove(&self.session_id);
        }
    }
}

fn skipped(reason: SkipReason) -> TurnOutcome {
    tracing::debug!(reason = ?reason, "turn skipped");
    TurnOutcome::Skipped(reason)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anywhere_llm::{Script, ScriptedService};
    use anywhere_storage::MemorySessionStore;

    use super::*;

    fn orchestrator(service: Arc<ScriptedService>) -> ConversationOrchestrator {
        ConversationOrchestrator::with_settings(
            service,
            Arc::new(MemorySessionStore::new()),
            EngineSettings::default(),
        )
        .expect("orchestrator")
    }

    fn settled(outcome: TurnOutcome) -> TurnReport {
        match outcome {
            TurnOutcome::Settled(report) => report,
            TurnOutcome::Skipped(reason) => panic!("turn skipped: {reason:?}"),
        }
    }

    #[test]
    fn construction_creates_an_active_default_session() {
        let orchestrator = orchestrator(Arc::new(ScriptedService::with_model_ids(["m1"])));

        let sessions = orchestrator.sessions().expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "New Chat");
        assert_eq!(orchestrator.active_session(), Some(sessions[0].id));
        assert_eq!(orchestrator.selected_model(), None);
    }

    #[test]
    fn new_session_is_numbered_and_activated() {
        let orchestrator = orchestrator(Arc::new(ScriptedService::with_model_ids(["m1"])));

        let second = orchestrator.new_session().expect("new session");
        let third = orchestrator.new_session().expect("new session");

        assert_eq!(second.name, "New Chat 2");
        assert_eq!(third.name, "New Chat 3");
        assert_eq!(orchestrator.active_session(), Some(third.id));
    }

    #[tokio::test]
    async fn refresh_selects_first_listed_model() {
        let orchestrator = orchestrator(Arc::new(ScriptedService::with_model_ids([
            "llava", "llama3",
        ])));

        let catalog = orchestrator.refresh_models().await;

        assert_eq!(catalog.models.len(), 2);
        assert_eq!(orchestrator.selected_model().as_deref(), Some("llava"));

        orchestrator.select_model(Some("llama3".to_string()));
        orchestrator.refresh_models().await;
        assert_eq!(orchestrator.selected_model().as_deref(), Some("llama3"));
    }

    #[tokio::test]
    async fn refresh_falls_back_to_configured_default_on_listing_failure() {
        let service =
            Arc::new(ScriptedService::with_model_ids(["m1"]).with_list_failure("offline"));
        let orchestrator = ConversationOrchestrator::with_settings(
            service,
            Arc::new(MemorySessionStore::new()),
            EngineSettings {
                default_model: Some("m1".to_string()),
                ..EngineSettings::default()
            },
        )
        .expect("orchestrator");
        orchestrator.select_model(None);

        let catalog = orchestrator.refresh_models().await;

        assert_eq!(catalog.source, anywhere_llm::ModelCatalogSource::ConfiguredFallback);
        assert!(catalog.warning.is_some());
        assert_eq!(orchestrator.selected_model().as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn send_is_skipped_without_model_or_input() {
        let service = Arc::new(ScriptedService::with_model_ids(["m1"]));
        let orchestrator = orchestrator(service.clone());

        let outcome = orchestrator.send_turn("hello", Vec::new()).await.expect("send");
        assert_eq!(outcome.skip_reason(), Some(SkipReason::NoModelSelected));

        orchestrator.select_model(Some("m1".to_string()));
        let outcome = orchestrator.send_turn("   ", Vec::new()).await.expect("send");
        assert_eq!(outcome.skip_reason(), Some(SkipReason::EmptyInput));

        assert!(orchestrator.active_messages().expect("messages").is_empty());
        assert!(service.requests().is_empty());
    }

    #[tokio::test]
    async fn attachment_only_send_encodes_images() {
        let service = Arc::new(
            ScriptedService::with_model_ids(["m1"]).with_script(Script::new().chunk("a cat")),
        );
        let orchestrator = orchestrator(service.clone());
        orchestrator.select_model(Some("m1".to_string()));
        orchestrator.stage_attachment(Attachment::new(b"Man".to_vec(), "cat.png"));

        let report = settled(orchestrator.send_staged_turn("").await.expect("send"));

        assert!(matches!(report.status, TurnStatus::Completed));
        let request = service.last_request().expect("request");
        assert_eq!(request.images, vec!["TWFu".to_string()]);
        assert!(orchestrator.staged_attachments().is_empty());

        let log = orchestrator.active_messages().expect("messages");
        assert_eq!(log[0].display_text(), " [1 image attached]");
    }

    #[tokio::test]
    async fn unstage_removes_only_the_named_attachment() {
        let orchestrator = orchestrator(Arc::new(ScriptedService::with_model_ids(["m1"])));
        let first = Attachment::new(vec![1_u8], "1.png");
        let second = Attachment::new(vec![2_u8], "2.png");
        orchestrator.stage_attachment(first.clone());
        orchestrator.stage_attachment(second.clone());

        assert_eq!(orchestrator.unstage_attachment(first.id), Some(first));
        assert_eq!(orchestrator.unstage_attachment(AttachmentId::new_v7()), None);
        assert_eq!(orchestrator.staged_attachments(), vec![second]);
    }

    #[tokio::test]
    async fn second_send_in_same_session_is_skipped_while_streaming() {
        let service = Arc::new(
            ScriptedService::with_model_ids(["m1"]).with_script(Script::new().chunk("Hi").stall()),
        );
        let orchestrator = Arc::new(orchestrator(service.clone()));
        orchestrator.select_model(Some("m1".to_string()));
        let session_id = orchestrator.active_session().expect("active session");

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send_turn("hello", Vec::new()).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.in_progress_text().as_deref() != Some("Hi") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("progress visible");

        let outcome = orchestrator.send_turn("again", Vec::new()).await.expect("send");
        assert_eq!(outcome.skip_reason(), Some(SkipReason::StreamInFlight));
        let outcome = orchestrator.retry_turn(0, None).await.expect("retry");
        assert_eq!(outcome.skip_reason(), Some(SkipReason::StreamInFlight));

        assert!(orchestrator.cancel_active_generation());
        let report = settled(running.await.expect("join").expect("send"));

        assert!(matches!(report.status, TurnStatus::Cancelled));
        assert_eq!(report.reply.display_text(), "Hi [stopped]");
        assert!(!orchestrator.is_generating(session_id));
        assert_eq!(orchestrator.in_progress_text(), None);
        assert_eq!(orchestrator.active_messages().expect("messages").len(), 2);
    }

    #[tokio::test]
    async fn retry_rejects_assistant_target() {
        let service = Arc::new(
            ScriptedService::with_model_ids(["m1"]).with_script(Script::new().chunk("Hi")),
        );
        let orchestrator = orchestrator(service.clone());
        orchestrator.select_model(Some("m1".to_string()));
        orchestrator.send_turn("hello", Vec::new()).await.expect("send");

        let outcome = orchestrator.retry_turn(1, None).await.expect("retry");

        assert_eq!(outcome.skip_reason(), Some(SkipReason::InvalidRetryTarget));
        assert_eq!(orchestrator.active_messages().expect("messages").len(), 2);
        assert_eq!(service.requests().len(), 1);
        assert!(!orchestrator.is_generating(orchestrator.active_session().expect("active")));
    }

    #[tokio::test]
    async fn retry_restages_and_resends_attachments() {
        let service = Arc::new(
            ScriptedService::with_model_ids(["m1"])
                .with_script(Script::new().chunk("one"))
                .with_script(Script::new().chunk("two")),
        );
        let orchestrator = orchestrator(service.clone());
        orchestrator.select_model(Some("m1".to_string()));
        let attachment = Attachment::new(b"Ma".to_vec(), "shot.png");
        orchestrator
            .send_turn("look", vec![attachment.clone()])
            .await
            .expect("send");

        let report = settled(orchestrator.retry_turn(0, Some(1)).await.expect("retry"));

        assert_eq!(report.reply.text, "two");
        assert_eq!(service.last_request().expect("request").images, vec!["TWE=".to_string()]);
        let log = orchestrator.active_messages().expect("messages");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].attachments, vec![attachment]);
        assert!(orchestrator.staged_attachments().is_empty());
    }

    #[tokio::test]
    async fn rejected_retry_keeps_staged_attachments() {
        let service = Arc::new(
            ScriptedService::with_model_ids(["m1"]).with_script(Script::new().chunk("Hi")),
        );
        let orchestrator = orchestrator(service);
        orchestrator.select_model(Some("m1".to_string()));
        orchestrator.send_turn("hello", Vec::new()).await.expect("send");
        let attachment = Attachment::new(vec![7_u8], "draft.png");
        orchestrator.stage_attachment(attachment.clone());

        let outcome = orchestrator.retry_turn(1, None).await.expect("retry");

        assert_eq!(outcome.skip_reason(), Some(SkipReason::InvalidRetryTarget));
        assert_eq!(orchestrator.staged_attachments(), vec![attachment]);
    }

    #[tokio::test]
    async fn abandoned_send_commits_partial_reply() {
        let service = Arc::new(
            ScriptedService::with_model_ids(["m1"]).with_script(Script::new().chunk("Hi").stall()),
        );
        let orchestrator = Arc::new(orchestrator(service));
        orchestrator.select_model(Some("m1".to_string()));
        let session_id = orchestrator.active_session().expect("active session");

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send_turn("hello", Vec::new()).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.in_progress_text().as_deref() != Some("Hi") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("progress visible");

        running.abort();
        let join_error = running.await.expect_err("task aborted");
        assert!(join_error.is_cancelled());

        let log = orchestrator.active_messages().expect("messages");
        assert_eq!(log.len(), 2);
        assert!(log[0].is_user());
        assert!(log[1].is_assistant());
        assert_eq!(log[1].text, "Hi");
        assert!(!log[1].terminated);
        assert_eq!(log[1].display_text(), "Hi [stopped]");
        assert!(!orchestrator.is_generating(session_id));
        assert_eq!(orchestrator.in_progress_text(), None);
    }

    #[tokio::test]
    async fn staged_attachments_belong_to_their_session() {
        let service = Arc::new(
            ScriptedService::with_model_ids(["m1"])
                .with_script(Script::new().chunk("one"))
                .with_script(Script::new().chunk("again").stall())
                .with_script(Script::new().chunk("b")),
        );
        let orchestrator = Arc::new(orchestrator(service.clone()));
        orchestrator.select_model(Some("m1".to_string()));
        let session_a = orchestrator.active_session().expect("active session");
        let session_b = orchestrator.create_session("B").expect("session").id;

        let kept = Attachment::new(b"Man".to_vec(), "kept.png");
        orchestrator.set_active_session(session_b).expect("activate b");
        orchestrator.stage_attachment(kept.clone());
        orchestrator.set_active_session(session_a).expect("activate a");
        assert!(orchestrator.staged_attachments().is_empty());

        let shot = Attachment::new(b"Ma".to_vec(), "shot.png");
        orchestrator
            .send_turn("look", vec![shot.clone()])
            .await
            .expect("send");

        let retrying = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.retry_turn(0, Some(1)).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.in_progress_text().as_deref() != Some("again") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("retry streaming");
        assert_eq!(orchestrator.staged_attachments(), vec![shot]);

        orchestrator.set_active_session(session_b).expect("activate b");
        assert_eq!(orchestrator.staged_attachments(), vec![kept]);
        settled(orchestrator.send_staged_turn("").await.expect("send in b"));
        assert_eq!(service.last_request().expect("request").images, vec!["TWFu".to_string()]);
        assert!(orchestrator.staged_attachments().is_empty());

        assert!(orchestrator.cancel_generation(session_a));
        settled(retrying.await.expect("join").expect("retry"));
        orchestrator.set_active_session(session_a).expect("activate a");
        assert!(orchestrator.staged_attachments().is_empty());
    }

    #[tokio::test]
    async fn unknown_model_commits_failure_notice() {
        let service = Arc::new(ScriptedService::with_model_ids(["m1"]));
        let orchestrator = orchestrator(service);
        orchestrator.select_model(Some("missing".to_string()));

        let report = settled(orchestrator.send_turn("hello", Vec::new()).await.expect("send"));

        assert!(matches!(
            report.status,
            TurnStatus::Failed {
                error: GenerationError::ModelRejected { .. }
            }
        ));
        assert!(report.reply.failed);
        assert_eq!(report.reply.text, crate::settings::DEFAULT_FAILURE_NOTICE);
        assert_eq!(report.reply_index, 1);
    }

    #[test]
    fn update_settings_reaches_the_store() {
        let orchestrator = orchestrator(Arc::new(ScriptedService::with_model_ids(["m1"])));

        orchestrator
            .update_settings(EngineSettings {
                retry_continuation: RetryContinuation::Rewind,
                ..EngineSettings::default()
            })
            .expect("update");

        assert_eq!(orchestrator.settings().retry_continuation, RetryContinuation::Rewind);
    }
}
