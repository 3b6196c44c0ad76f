//! Persistence seams. The chat service only talks to storage through these
//! traits so it can run against MongoDB in production and the in-memory
//! backend in tests.

use async_trait::async_trait;
use shared::models::{chat::Chat, message::Message, user::User};

use crate::error::AppResult;

pub mod memory;
pub mod mongo;

/// Atomic unit of work against one chat document and its messages.
///
/// Committing checks that the stored chat is still at `expected_version`,
/// replaces it with `chat`, inserts `append` and records `seen`. Either all
/// of it becomes visible or none of it does.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub expected_version: i64,
    pub chat: Chat,
    pub append: Option<Message>,
    pub seen: Option<SeenBy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenBy {
    pub user_id: String,
    pub message_ids: Vec<String>,
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Fails with `AlreadyExists` when the id is taken.
    async fn insert_chat(&self, chat: &Chat) -> AppResult<()>;

    async fn find_chat(&self, chat_id: &str) -> AppResult<Option<Chat>>;

    async fn find_chats_for_member(&self, user_id: &str) -> AppResult<Vec<Chat>>;

    /// All messages of a chat in ascending `(sent_at, id)` order.
    async fn find_messages(&self, chat_id: &str) -> AppResult<Vec<Message>>;

    /// The subset of `message_ids` that exists in the chat, in no particular order.
    async fn find_messages_by_ids(
        &self,
        chat_id: &str,
        message_ids: &[String],
    ) -> AppResult<Vec<Message>>;

    /// Fails with `TransactionConflict` when the chat moved past
    /// `expected_version`, `NotFound` when it is gone and `AlreadyExists`
    /// when the appended message id is taken.
    async fn commit(&self, tx: &Transaction) -> AppResult<()>;
}

/// Read-only view of the identity service's user records.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> AppResult<User>;

    async fn list_users(&self) -> AppResult<Vec<User>>;

    async fn find_users(&self, user_ids: &[String]) -> AppResult<Vec<User>>;
}
