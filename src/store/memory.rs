use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use shared::models::{chat::Chat, message::Message, user::User};
use tokio::sync::RwLock;

use super::{ChatRepository, Transaction, UserDirectory};
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct State {
    chats: HashMap<String, Chat>,
    // chat id -> message id -> message
    messages: HashMap<String, HashMap<String, Message>>,
}

/// Process-local backend. A single lock covers chats and messages, which
/// makes every commit trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn insert_chat(&self, chat: &Chat) -> AppResult<()> {
        let mut state = self.state.write().await;

        if state.chats.contains_key(&chat.id) {
            return Err(AppError::AlreadyExists(format!("chat {}", chat.id)));
        }

        state.chats.insert(chat.id.clone(), chat.clone());

        Ok(())
    }

    async fn find_chat(&self, chat_id: &str) -> AppResult<Option<Chat>> {
        Ok(self.state.read().await.chats.get(chat_id).cloned())
    }

    async fn find_chats_for_member(&self, user_id: &str) -> AppResult<Vec<Chat>> {
        let state = self.state.read().await;

        Ok(state
            .chats
            .values()
            .filter(|chat| chat.is_member(user_id))
            .cloned()
            .collect())
    }

    async fn find_messages(&self, chat_id: &str) -> AppResult<Vec<Message>> {
        let state = self.state.read().await;

        let mut messages: Vec<Message> = state
            .messages
            .get(chat_id)
            .map(|messages| messages.values().cloned().collect())
            .unwrap_or_default();

        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        Ok(messages)
    }

    async fn find_messages_by_ids(
        &self,
        chat_id: &str,
        message_ids: &[String],
    ) -> AppResult<Vec<Message>> {
        let state = self.state.read().await;

        let Some(messages) = state.messages.get(chat_id) else {
            return Ok(Vec::new());
        };

        Ok(message_ids
            .iter()
            .filter_map(|id| messages.get(id).cloned())
            .collect())
    }

    async fn commit(&self, tx: &Transaction) -> AppResult<()> {
        let mut state = self.state.write().await;
        let state = &mut *state;

        let stored = state
            .chats
            .get(&tx.chat.id)
            .ok_or_else(|| AppError::NotFound(format!("chat {}", tx.chat.id)))?;

        if stored.version != tx.expected_version {
            return Err(AppError::TransactionConflict);
        }

        let messages = state.messages.entry(tx.chat.id.clone()).or_default();

        if let Some(message) = &tx.append {
            if messages.contains_key(&message.id) {
                return Err(AppError::AlreadyExists(format!("message {}", message.id)));
            }
        }

        // validated, apply
        if let Some(message) = &tx.append {
            messages.insert(message.id.clone(), message.clone());
        }

        if let Some(seen) = &tx.seen {
            for id in &seen.message_ids {
                if let Some(message) = messages.get_mut(id) {
                    message.seen_by.insert(seen.user_id.clone());
                }
            }
        }

        state.chats.insert(tx.chat.id.clone(), tx.chat.clone());

        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<BTreeMap<String, User>>,
}

impl MemoryDirectory {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        MemoryDirectory {
            users: RwLock::new(
                users
                    .into_iter()
                    .map(|user| (user.id.clone(), user))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn get_user(&self, user_id: &str) -> AppResult<User> {
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
    }

    async fn list_users(&self) -> AppResult<Vec<User>> {
        Ok(self.users.read().await.values().cloned().collect())
    }

    async fn find_users(&self, user_ids: &[String]) -> AppResult<Vec<User>> {
        let users = self.users.read().await;

        Ok(user_ids
            .iter()
            .filter_map(|id| users.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use mongodb::bson::DateTime;
    use shared::models::chat::ChatType;

    use super::*;
    use crate::store::SeenBy;

    fn chat(id: &str) -> Chat {
        Chat {
            id: id.to_string(),
            chat_type: ChatType::Individual,
            name: String::new(),
            image_url: String::new(),
            member_ids: BTreeSet::from(["A".to_string(), "B".to_string()]),
            admins: BTreeSet::new(),
            created_by: "A".to_string(),
            created_at: DateTime::from_millis(0),
            bio: String::new(),
            last_message: None,
            is_pinned: BTreeSet::new(),
            is_muted: BTreeSet::new(),
            is_read: BTreeSet::new(),
            unread_count: BTreeMap::from([("A".to_string(), 0), ("B".to_string(), 0)]),
            version: 0,
        }
    }

    fn message(id: &str, at: i64) -> Message {
        Message {
            id: id.to_string(),
            chat_id: "A_B".to_string(),
            sender_id: "A".to_string(),
            text: id.to_string(),
            image_url: String::new(),
            sent_at: DateTime::from_millis(at),
            seen_by: BTreeSet::from(["A".to_string()]),
        }
    }

    fn append(chat: &Chat, expected_version: i64, message: Message) -> Transaction {
        let mut next = chat.clone();
        next.version = expected_version + 1;

        Transaction {
            expected_version,
            chat: next,
            append: Some(message),
            seen: None,
        }
    }

    #[actix_web::test]
    async fn insert_rejects_duplicate_ids() {
        let store = MemoryStore::new();

        store.insert_chat(&chat("A_B")).await.unwrap();

        assert!(matches!(
            store.insert_chat(&chat("A_B")).await,
            Err(AppError::AlreadyExists(_))
        ));
    }

    #[actix_web::test]
    async fn stale_version_is_a_conflict_and_leaves_no_trace() {
        let store = MemoryStore::new();
        let chat = chat("A_B");
        store.insert_chat(&chat).await.unwrap();

        store.commit(&append(&chat, 0, message("m1", 1))).await.unwrap();

        let stale = append(&chat, 0, message("m2", 2));
        assert_eq!(
            store.commit(&stale).await,
            Err(AppError::TransactionConflict)
        );

        let ids: Vec<String> = store
            .find_messages("A_B")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1"]);
        assert_eq!(store.find_chat("A_B").await.unwrap().unwrap().version, 1);
    }

    #[actix_web::test]
    async fn messages_are_ordered_by_time_then_id() {
        let store = MemoryStore::new();
        let chat = chat("A_B");
        store.insert_chat(&chat).await.unwrap();

        store.commit(&append(&chat, 0, message("m2", 5))).await.unwrap();
        store.commit(&append(&chat, 1, message("m1", 5))).await.unwrap();
        store.commit(&append(&chat, 2, message("m0", 9))).await.unwrap();

        let ids: Vec<String> = store
            .find_messages("A_B")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m0"]);
    }

    #[actix_web::test]
    async fn seen_updates_are_set_unions() {
        let store = MemoryStore::new();
        let chat = chat("A_B");
        store.insert_chat(&chat).await.unwrap();
        store.commit(&append(&chat, 0, message("m1", 1))).await.unwrap();

        for expected_version in [1, 2] {
            let mut next = chat.clone();
            next.version = expected_version + 1;

            store
                .commit(&Transaction {
                    expected_version,
                    chat: next,
                    append: None,
                    seen: Some(SeenBy {
                        user_id: "B".to_string(),
                        message_ids: vec!["m1".to_string(), "missing".to_string()],
                    }),
                })
                .await
                .unwrap();
        }

        let messages = store
            .find_messages_by_ids("A_B", &["m1".to_string()])
            .await
            .unwrap();
        assert_eq!(
            messages[0].seen_by,
            BTreeSet::from(["A".to_string(), "B".to_string()])
        );
    }

    #[actix_web::test]
    async fn commit_on_missing_chat_is_not_found() {
        let store = MemoryStore::new();
        let chat = chat("A_B");

        assert!(matches!(
            store.commit(&append(&chat, 0, message("m1", 1))).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[actix_web::test]
    async fn users_are_listed_in_id_order() {
        let user = |id: &str, name: &str| User {
            id: id.to_string(),
            name: name.to_string(),
            email: format!("{id}@example.com"),
            profile_image_url: None,
            about: None,
        };
        let directory = MemoryDirectory::new([user("b", "Ann"), user("a", "Zed")]);

        let ids: Vec<String> = directory
            .list_users()
            .await
            .unwrap()
            .into_iter()
            .map(|user| user.id)
            .collect();

        assert_eq!(ids, vec!["a", "b"]);
    }
}
