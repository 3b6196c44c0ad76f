use std::{collections::BTreeSet, sync::Arc};

use shared::models::chat::Chat;
use tracing::debug;

use crate::{
    error::{AppError, AppResult},
    fanout::{ChangeEvent, FanoutHandle},
    store::{ChatRepository, SeenBy, Transaction, UserDirectory},
};

/// Chat backend shared by every request handler. The operations live in
/// `chat_store`, `message_log` and `reconciler`.
pub struct ChatService {
    pub(crate) repo: Arc<dyn ChatRepository>,
    pub(crate) directory: Arc<dyn UserDirectory>,
    pub(crate) fanout: FanoutHandle,
    max_attempts: u32,
}

/// Outcome of staging a change against the current chat document.
pub(crate) enum Staged<T> {
    Unchanged(T),
    Commit {
        chat: Chat,
        append: Option<shared::models::message::Message>,
        seen: Option<SeenBy>,
        output: T,
    },
}

impl<T> Staged<T> {
    pub(crate) fn chat(chat: Chat, output: T) -> Self {
        Staged::Commit {
            chat,
            append: None,
            seen: None,
            output,
        }
    }
}

impl ChatService {
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        directory: Arc<dyn UserDirectory>,
        fanout: FanoutHandle,
        max_attempts: u32,
    ) -> Self {
        ChatService {
            repo,
            directory,
            fanout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub(crate) async fn load_chat(&self, chat_id: &str) -> AppResult<Chat> {
        self.repo
            .find_chat(chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))
    }

    /// Load a chat the caller belongs to. Non-members see `NotFound`.
    pub(crate) async fn load_member_chat(&self, actor: &str, chat_id: &str) -> AppResult<Chat> {
        let chat = self.load_chat(chat_id).await?;
        ensure_member(&chat, actor)?;

        Ok(chat)
    }

    /// Optimistic read-modify-write of one chat. `stage` sees the latest
    /// stored state on every attempt; a version conflict re-reads and
    /// re-stages, up to the configured number of attempts.
    pub(crate) async fn transact<T, F>(&self, chat_id: &str, mut stage: F) -> AppResult<T>
    where
        F: FnMut(&Chat) -> AppResult<Staged<T>>,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.load_chat(chat_id).await?;

            let (mut chat, append, seen, output) = match stage(&current)? {
                Staged::Unchanged(output) => return Ok(output),
                Staged::Commit {
                    chat,
                    append,
                    seen,
                    output,
                } => (chat, append, seen, output),
            };

            chat.version = current.version + 1;

            let tx = Transaction {
                expected_version: current.version,
                chat,
                append,
                seen,
            };

            match self.repo.commit(&tx).await {
                Ok(()) => {
                    self.announce(&current, &tx);
                    return Ok(output);
                }
                Err(AppError::TransactionConflict) => {
                    debug!(chat_id, attempt, "transaction conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        }

        Err(AppError::Unavailable(format!(
            "chat {chat_id} stayed contended after {} attempts",
            self.max_attempts
        )))
    }

    fn announce(&self, before: &Chat, tx: &Transaction) {
        let user_ids: BTreeSet<&String> = before
            .member_ids
            .iter()
            .chain(tx.chat.member_ids.iter())
            .collect();

        self.fanout.publish(ChangeEvent {
            chat_id: tx.chat.id.clone(),
            user_ids: user_ids.into_iter().cloned().collect(),
            messages_changed: tx.append.is_some()
                || tx.seen.is_some()
                || before.member_ids != tx.chat.member_ids,
        });
    }
}

pub(crate) fn ensure_member(chat: &Chat, user_id: &str) -> AppResult<()> {
    if chat.is_member(user_id) {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("chat {}", chat.id)))
    }
}

/// The caller must act on their own behalf.
pub(crate) fn ensure_self(actor: &str, user_id: &str) -> AppResult<()> {
    if actor == user_id {
        Ok(())
    } else {
        Err(AppError::Unauthorized(format!(
            "cannot act on behalf of {user_id}"
        )))
    }
}

const MAX_ID_LEN: usize = 128;

/// User and message ids: 1..=128 ASCII alphanumerics or `-`.
pub(crate) fn validate_id(kind: &str, id: &str) -> AppResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidArgument(format!("malformed {kind} id '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use shared::models::message::Message;

    use super::*;
    use crate::{store::memory::MemoryDirectory, testing};

    /// Repository double whose commits always lose the race.
    struct AlwaysContended {
        chat: Chat,
        commits: AtomicU32,
    }

    #[async_trait]
    impl ChatRepository for AlwaysContended {
        async fn insert_chat(&self, _chat: &Chat) -> AppResult<()> {
            Ok(())
        }

        async fn find_chat(&self, _chat_id: &str) -> AppResult<Option<Chat>> {
            Ok(Some(self.chat.clone()))
        }

        async fn find_chats_for_member(&self, _user_id: &str) -> AppResult<Vec<Chat>> {
            Ok(vec![self.chat.clone()])
        }

        async fn find_messages(&self, _chat_id: &str) -> AppResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn find_messages_by_ids(
            &self,
            _chat_id: &str,
            _message_ids: &[String],
        ) -> AppResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn commit(&self, _tx: &Transaction) -> AppResult<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Err(AppError::TransactionConflict)
        }
    }

    #[actix_web::test]
    async fn exhausted_retries_surface_unavailable() {
        let repo = Arc::new(AlwaysContended {
            chat: testing::group_chat("g1", &["A", "B"], &["A"]),
            commits: AtomicU32::new(0),
        });
        let service = ChatService::new(
            repo.clone(),
            Arc::new(MemoryDirectory::default()),
            testing::fanout(),
            3,
        );

        let result = service
            .transact("g1", |chat| Ok(Staged::chat(chat.clone(), ())))
            .await;

        assert!(matches!(result, Err(AppError::Unavailable(_))));
        assert_eq!(repo.commits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn validates_ids() {
        assert!(validate_id("user", "u-1A").is_ok());
        assert!(validate_id("user", "").is_err());
        assert!(validate_id("user", "a_b").is_err());
        assert!(validate_id("user", "a.b").is_err());
        assert!(validate_id("user", &"x".repeat(129)).is_err());
    }
}
