use std::sync::Arc;

use anywhere_llm::ContinuationState;
use arc_swap::{ArcSwap, ArcSwapOption};
use snafu::OptionExt;

use super::SessionStore;
use super::error::{NotFoundSnafu, StorageResult};
use super::ids::SessionId;
use super::types::{Message, MessageLog, Session, SessionSummary};

struct SessionCell {
    id: SessionId,
    name: String,
    log: ArcSwap<Vec<Message>>,
    continuation: ArcSwap<ContinuationState>,
}

impl SessionCell {
    fn new(name: &str) -> Self {
        Self {
            id: SessionId::new_v7(),
            name: name.to_string(),
            log: ArcSwap::from_pointee(Vec::new()),
            continuation: ArcSwap::from_pointee(ContinuationState::empty()),
        }
    }

    fn snapshot(&self) -> Session {
        Session {
            id: self.id,
            name: self.name.clone(),
            messages: self.log.load_full(),
            continuation: ContinuationState::clone(&self.continuation.load()),
        }
    }
}

/// Process-local session store.
///
/// Every log and continuation state sits behind its own `ArcSwap`, so readers always
/// observe a complete log: appends and splices publish a new vector in one pointer swap.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: ArcSwap<Vec<Arc<SessionCell>>>,
    active: ArcSwapOption<SessionId>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, session_id: SessionId, stage: &'static str) -> StorageResult<Arc<SessionCell>> {
        self.sessions
            .load()
            .iter()
            .find(|cell| cell.id == session_id)
            .cloned()
            .context(NotFoundSnafu {
                stage,
                entity: "session",
                id: session_id.to_string(),
            })
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&self, name: &str) -> StorageResult<Session> {
        let cell = Arc::new(SessionCell::new(name));
        let session = cell.snapshot();

        self.sessions.rcu(|sessions| {
            let mut next = Vec::clone(sessions);
            next.push(cell.clone());
            next
        });

        tracing::debug!(session_id = %session.id, name = %session.name, "created session");
        Ok(session)
    }

    fn list_sessions(&self) -> StorageResult<Vec<SessionSummary>> {
        Ok(self
            .sessions
            .load()
            .iter()
            .map(|cell| SessionSummary {
                id: cell.id,
                name: cell.name.clone(),
                message_count: cell.log.load().len(),
            })
            .collect())
    }

    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<Session>> {
        Ok(self
            .sessions
            .load()
            .iter()
            .find(|cell| cell.id == session_id)
            .map(|cell| cell.snapshot()))
    }

    fn active_session(&self) -> Option<SessionId> {
        self.active.load_full().map(|session_id| *session_id)
    }

    fn set_active(&self, session_id: SessionId) -> StorageResult<()> {
        self.cell(session_id, "session-set-active")?;
        self.active.store(Some(Arc::new(session_id)));
        Ok(())
    }

    fn messages(&self, session_id: SessionId) -> StorageResult<MessageLog> {
        Ok(self.cell(session_id, "message-list")?.log.load_full())
    }

    fn continuation_state(&self, session_id: SessionId) -> StorageResult<ContinuationState> {
        let cell = self.cell(session_id, "continuation-load")?;
        let state = ContinuationState::clone(&cell.continuation.load());
        Ok(state)
    }

    fn commit_message(&self, session_id: SessionId, message: Message) -> StorageResult<usize> {
        let cell = self.cell(session_id, "message-commit")?;
        let previous = cell.log.rcu(|log| {
            let mut next = Vec::clone(log);
            next.push(message.clone());
            next
        });
        Ok(previous.len())
    }

    fn replace_log(&self, session_id: SessionId, log: Vec<Message>) -> StorageResult<()> {
        let cell = self.cell(session_id, "message-replace-log")?;
        cell.log.store(Arc::new(log));
        Ok(())
    }

    fn update_continuation_state(
        &self,
        session_id: SessionId,
        state: ContinuationState,
    ) -> StorageResult<()> {
        let cell = self.cell(session_id, "continuation-update")?;
        cell.continuation.store(Arc::new(state));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::StorageError;
    use crate::types::Role;

    #[test]
    fn create_session_does_not_change_active_pointer() {
        let store = MemorySessionStore::new();
        let first = store.create_session("New Chat").expect("create");
        assert_eq!(store.active_session(), None);

        store.set_active(first.id).expect("activate");
        let second = store.create_session("New Chat 2").expect("create");

        assert_eq!(store.active_session(), Some(first.id));
        assert!(second.messages.is_empty());
        assert!(second.continuation.is_empty());

        let names = store
            .list_sessions()
            .expect("list")
            .into_iter()
            .map(|summary| summary.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["New Chat", "New Chat 2"]);
    }

    #[test]
    fn unknown_session_is_not_found() {
        let store = MemorySessionStore::new();
        let missing = SessionId::new_v7();

        assert!(matches!(
            store.set_active(missing),
            Err(StorageError::NotFound { entity: "session", .. })
        ));
        assert!(store.messages(missing).is_err());
        assert!(store.get_session(missing).expect("lookup").is_none());
    }

    #[test]
    fn commits_append_without_touching_earlier_snapshots() {
        let store = MemorySessionStore::new();
        let session = store.create_session("chat").expect("create");

        let index = store
            .commit_message(session.id, Message::user("hello", Vec::new()))
            .expect("commit");
        assert_eq!(index, 0);

        let before = store.messages(session.id).expect("messages");
        let index = store
            .commit_message(session.id, Message::assistant("Hi", "m1"))
            .expect("commit");
        assert_eq!(index, 1);

        let after = store.messages(session.id).expect("messages");
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert_eq!(after[1].role, Role::Assistant);
    }

    #[test]
    fn continuation_state_is_per_session() {
        let store = MemorySessionStore::new();
        let left = store.create_session("left").expect("create");
        let right = store.create_session("right").expect("create");

        store
            .update_continuation_state(left.id, ContinuationState::from([1, 2, 3]))
            .expect("update");

        assert_eq!(
            store.continuation_state(left.id).expect("load"),
            ContinuationState::from([1, 2, 3])
        );
        assert!(store.continuation_state(right.id).expect("load").is_empty());
    }

    #[test]
    fn readers_never_observe_a_partial_log_replacement() {
        let store = MemorySessionStore::new();
        let session = store.create_session("chat").expect("create");
        let short = vec![Message::user("a", Vec::new())];
        let long = (0..64)
            .map(|index| Message::user(format!("m{index}"), Vec::new()))
            .collect::<Vec<_>>();
        store.replace_log(session.id, short.clone()).expect("seed");

        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..500 {
                    let next = if round % 2 == 0 { long.clone() } else { short.clone() };
                    store.replace_log(session.id, next).expect("replace");
                }
                done.store(true, Ordering::SeqCst);
            });

            while !done.load(Ordering::SeqCst) {
                let seen = store.messages(session.id).expect("messages");
                assert!(seen.len() == short.len() || seen.len() == long.len());
            }
        });
    }
}
