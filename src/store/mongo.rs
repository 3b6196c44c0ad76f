use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    Client, ClientSession, Collection, Database, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::models::{chat::Chat, message::Message, user::User};
use tracing::{debug, info};

use super::{ChatRepository, Transaction, UserDirectory};
use crate::error::{AppError, AppResult};

const CHATS: &str = "chats";
const MESSAGES: &str = "messages";
const USERS: &str = "users";

const COMMIT_ATTEMPTS: usize = 3;

/// MongoDB backend. Commits run as multi-document transactions, so the
/// deployment must be a replica set.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    pub async fn init(uri: &str, database: &str) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(uri).await?;

        let store = MongoStore {
            database: client.database(database),
            client,
        };

        store.ensure_indexes().await?;

        info!(database, "connected to MongoDB");

        Ok(store)
    }

    async fn ensure_indexes(&self) -> anyhow::Result<()> {
        self.messages()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "chatId": 1, "sentAt": 1, "_id.id": 1 })
                    .build(),
            )
            .await?;

        self.chats()
            .create_index(IndexModel::builder().keys(doc! { "memberIds": 1 }).build())
            .await?;

        Ok(())
    }

    fn chats(&self) -> Collection<Document> {
        self.database.collection(CHATS)
    }

    fn messages(&self) -> Collection<Document> {
        self.database.collection(MESSAGES)
    }

    fn users(&self) -> Collection<Document> {
        self.database.collection(USERS)
    }

    async fn apply(&self, tx: &Transaction, session: &mut ClientSession) -> AppResult<()> {
        let replaced = self
            .chats()
            .replace_one(
                doc! { "_id": tx.chat.id.as_str(), "version": tx.expected_version },
                to_document(&tx.chat)?,
            )
            .session(&mut *session)
            .await?;

        if replaced.matched_count == 0 {
            let exists = self
                .chats()
                .find_one(doc! { "_id": tx.chat.id.as_str() })
                .session(&mut *session)
                .await?
                .is_some();

            return Err(if exists {
                AppError::TransactionConflict
            } else {
                AppError::NotFound(format!("chat {}", tx.chat.id))
            });
        }

        if let Some(message) = &tx.append {
            self.messages()
                .insert_one(message_to_document(message)?)
                .session(&mut *session)
                .await
                .map_err(|err| match AppError::from(err) {
                    AppError::AlreadyExists(_) => {
                        AppError::AlreadyExists(format!("message {}", message.id))
                    }
                    other => other,
                })?;
        }

        if let Some(seen) = &tx.seen {
            self.messages()
                .update_many(
                    doc! {
                        "chatId": tx.chat.id.as_str(),
                        "_id.id": { "$in": id_list(&seen.message_ids) },
                    },
                    doc! { "$addToSet": { "seenBy": seen.user_id.as_str() } },
                )
                .session(&mut *session)
                .await?;
        }

        Ok(())
    }

    async fn commit_with_retry(session: &mut ClientSession) -> AppResult<()> {
        let mut attempt = 1;

        loop {
            match session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(err)
                    if attempt < COMMIT_ATTEMPTS
                        && err.contains_label(mongodb::error::UNKNOWN_TRANSACTION_COMMIT_RESULT) =>
                {
                    debug!(attempt, "retrying commit with unknown outcome");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Stores the model's `id` as the document `_id`.
fn to_document<T: Serialize>(value: &T) -> AppResult<Document> {
    let mut document = bson::to_document(value)?;

    if let Some(id) = document.remove("id") {
        document.insert("_id", id);
    }

    Ok(document)
}

fn from_document<T: DeserializeOwned>(mut document: Document) -> AppResult<T> {
    if let Some(id) = document.remove("_id") {
        document.insert("id", id);
    }

    Ok(bson::from_document(document)?)
}

/// Message ids are unique per chat, so the document key pairs them with
/// the chat id.
fn message_to_document(message: &Message) -> AppResult<Document> {
    let mut document = bson::to_document(message)?;

    document.remove("id");
    document.insert(
        "_id",
        doc! { "chatId": message.chat_id.as_str(), "id": message.id.as_str() },
    );

    Ok(document)
}

fn message_from_document(mut document: Document) -> AppResult<Message> {
    if let Some(Bson::Document(mut key)) = document.remove("_id") {
        if let Some(id) = key.remove("id") {
            document.insert("id", id);
        }
    }

    Ok(bson::from_document(document)?)
}

fn id_list(ids: &[String]) -> Bson {
    Bson::Array(ids.iter().cloned().map(Bson::String).collect())
}

#[async_trait]
impl ChatRepository for MongoStore {
    async fn insert_chat(&self, chat: &Chat) -> AppResult<()> {
        self.chats()
            .insert_one(to_document(chat)?)
            .await
            .map_err(|err| match AppError::from(err) {
                AppError::AlreadyExists(_) => AppError::AlreadyExists(format!("chat {}", chat.id)),
                other => other,
            })?;

        Ok(())
    }

    async fn find_chat(&self, chat_id: &str) -> AppResult<Option<Chat>> {
        self.chats()
            .find_one(doc! { "_id": chat_id })
            .await?
            .map(from_document)
            .transpose()
    }

    async fn find_chats_for_member(&self, user_id: &str) -> AppResult<Vec<Chat>> {
        let documents: Vec<Document> = self
            .chats()
            .find(doc! { "memberIds": user_id })
            .await?
            .try_collect()
            .await?;

        documents.into_iter().map(from_document).collect()
    }

    async fn find_messages(&self, chat_id: &str) -> AppResult<Vec<Message>> {
        let documents: Vec<Document> = self
            .messages()
            .find(doc! { "chatId": chat_id })
            .sort(doc! { "sentAt": 1, "_id.id": 1 })
            .await?
            .try_collect()
            .await?;

        documents.into_iter().map(message_from_document).collect()
    }

    async fn find_messages_by_ids(
        &self,
        chat_id: &str,
        message_ids: &[String],
    ) -> AppResult<Vec<Message>> {
        let documents: Vec<Document> = self
            .messages()
            .find(doc! { "chatId": chat_id, "_id.id": { "$in": id_list(message_ids) } })
            .await?
            .try_collect()
            .await?;

        documents.into_iter().map(message_from_document).collect()
    }

    async fn commit(&self, tx: &Transaction) -> AppResult<()> {
        let mut session = self.client.start_session().await?;

        session.start_transaction().await?;

        match self.apply(tx, &mut session).await {
            Ok(()) => Self::commit_with_retry(&mut session).await,
            Err(err) => {
                // the server may already have aborted it
                let _ = session.abort_transaction().await;

                Err(err)
            }
        }
    }
}

#[async_trait]
impl UserDirectory for MongoStore {
    async fn get_user(&self, user_id: &str) -> AppResult<User> {
        self.users()
            .find_one(doc! { "_id": user_id })
            .await?
            .map(from_document)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
    }

    async fn list_users(&self) -> AppResult<Vec<User>> {
        let documents: Vec<Document> = self
            .users()
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .await?
            .try_collect()
            .await?;

        documents.into_iter().map(from_document).collect()
    }

    async fn find_users(&self, user_ids: &[String]) -> AppResult<Vec<User>> {
        let documents: Vec<Document> = self
            .users()
            .find(doc! { "_id": { "$in": id_list(user_ids) } })
            .await?
            .try_collect()
            .await?;

        documents.into_iter().map(from_document).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use mongodb::bson::DateTime;

    use super::*;

    fn message(chat_id: &str, id: &str) -> Message {
        Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: "A".to_string(),
            text: "hi".to_string(),
            image_url: String::new(),
            sent_at: DateTime::from_millis(42),
            seen_by: BTreeSet::from(["A".to_string()]),
        }
    }

    #[test]
    fn model_id_round_trips_through_document_id() {
        let user = User {
            id: "u1".to_string(),
            name: "User".to_string(),
            email: "u1@example.com".to_string(),
            profile_image_url: None,
            about: None,
        };

        let document = to_document(&user).unwrap();

        assert_eq!(document.get_str("_id").unwrap(), "u1");
        assert!(document.get("id").is_none());

        let decoded: User = from_document(document).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn message_keys_are_scoped_to_their_chat() {
        let first = message_to_document(&message("A_B", "m1")).unwrap();
        let second = message_to_document(&message("A_C", "m1")).unwrap();

        assert_ne!(first.get("_id"), second.get("_id"));
        assert_eq!(
            first.get_document("_id").unwrap().get_str("id").unwrap(),
            "m1"
        );
        assert!(first.get("id").is_none());
        assert!(matches!(first.get("sentAt"), Some(Bson::DateTime(_))));

        let decoded = message_from_document(first).unwrap();
        assert_eq!(decoded, message("A_B", "m1"));
    }
}
