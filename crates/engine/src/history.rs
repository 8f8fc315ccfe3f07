//! Pure edits of a session's message log.
//!
//! Nothing here touches storage or the generation service; callers install the returned
//! log themselves. Indices refer to one rendering of the log and go stale after any edit.

use anywhere_storage::{Message, Role};
use snafu::{Snafu, ensure};

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SpliceError {
    #[snafu(display("user message index {index} is outside a log of {len} messages"))]
    UserIndexOutOfRange {
        stage: &'static str,
        index: usize,
        len: usize,
    },
    #[snafu(display("message at index {index} is not a user message"))]
    NotAUserMessage { stage: &'static str, index: usize },
    #[snafu(display("assistant message index {index} is outside a log of {len} messages"))]
    AssistantIndexOutOfRange {
        stage: &'static str,
        index: usize,
        len: usize,
    },
    #[snafu(display("assistant message index {index} equals the user message index"))]
    OverlappingIndices { stage: &'static str, index: usize },
}

/// Result of splicing a turn out of the log for regeneration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySplice {
    /// Shortened log that already ends with `replayed`.
    pub log: Vec<Message>,
    /// Fresh copy of the user message to submit again.
    pub replayed: Message,
    /// The assistant reply that was removed, if one was named.
    pub removed_reply: Option<Message>,
}

pub fn append_turn(log: &[Message], user_message: Message) -> Vec<Message> {
    let mut next = Vec::with_capacity(log.len() + 1);
    next.extend_from_slice(log);
    next.push(user_message);
    next
}

/// Removes the user message and its reply, then re-appends a copy of the user message.
///
/// Removal goes from the higher index to the lower one so the second index is not
/// shifted by the first removal.
pub fn splice_retry(
    log: &[Message],
    user_index: usize,
    assistant_index: Option<usize>,
) -> Result<RetrySplice, SpliceError> {
    let len = log.len();
    ensure!(
        user_index < len,
        UserIndexOutOfRangeSnafu {
            stage: "splice-retry-user-index",
            index: user_index,
            len,
        }
    );
    ensure!(
        log[user_index].role == Role::User,
        NotAUserMessageSnafu {
            stage: "splice-retry-user-role",
            index: user_index,
        }
    );

    if let Some(index) = assistant_index {
        ensure!(
            index < len,
            AssistantIndexOutOfRangeSnafu {
                stage: "splice-retry-assistant-index",
                index,
                len,
            }
        );
        ensure!(
            index != user_index,
            OverlappingIndicesSnafu {
                stage: "splice-retry-overlap",
                index,
            }
        );
    }

    let mut next = log.to_vec();
    let (user_message, removed_reply) = match assistant_index {
        Some(reply_index) if reply_index > user_index => {
            let reply = next.remove(reply_index);
            (next.remove(user_index), Some(reply))
        }
        Some(reply_index) => {
            let user_message = next.remove(user_index);
            (user_message, Some(next.remove(reply_index)))
        }
        None => (next.remove(user_index), None),
    };

    let replayed = user_message.replayed();
    next.push(replayed.clone());

    Ok(RetrySplice {
        log: next,
        replayed,
        removed_reply,
    })
}

/// Nearest user message before `assistant_index`, which is the prompt a retry of that
/// reply resubmits.
pub fn preceding_user_index(log: &[Message], assistant_index: usize) -> Option<usize> {
    log.get(..assistant_index)?
        .iter()
        .rposition(|message| message.role == Role::User)
}
