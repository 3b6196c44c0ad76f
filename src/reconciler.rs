//! Keeps the per-chat read state (`lastMessage`, `isRead`, `unreadCount`)
//! consistent with the message log. Every send and every seen receipt
//! commits the message change and the chat aggregate in one transaction.

use std::collections::BTreeSet;

use mongodb::bson::DateTime;
use shared::{
    api::message::{CreateRequest, SeenRequest, SeenResponse},
    models::{
        chat::{Chat, LastMessage},
        message::Message,
    },
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    service::{ensure_member, ensure_self, validate_id, ChatService, Staged},
    store::SeenBy,
};

/// Send time for a new message: never earlier than, and never equal to,
/// the chat's current last message, so message order within a chat is
/// strict even when the clock stalls or steps back.
pub fn next_sent_at(chat: &Chat, now: DateTime) -> DateTime {
    match &chat.last_message {
        Some(last) if last.at >= now => DateTime::from_millis(last.at.timestamp_millis() + 1),
        _ => now,
    }
}

/// Chat aggregate after `message` is appended.
pub fn apply_send(chat: &mut Chat, message: &Message) {
    chat.last_message = Some(LastMessage {
        text: message.preview(),
        sender_id: message.sender_id.clone(),
        message_id: message.id.clone(),
        at: message.sent_at,
    });

    chat.is_read = BTreeSet::from([message.sender_id.clone()]);

    for member in &chat.member_ids {
        let count = chat.unread_count.entry(member.clone()).or_insert(0);
        if *member == message.sender_id {
            *count = 0;
        } else {
            *count = count.saturating_add(1);
        }
    }
}

/// Chat aggregate after `user_id` saw `message_ids`. The counter is reset,
/// not decremented.
pub fn apply_seen(chat: &mut Chat, user_id: &str, message_ids: &[String]) {
    chat.unread_count.insert(user_id.to_string(), 0);

    let covers_last = chat
        .last_message
        .as_ref()
        .is_some_and(|last| message_ids.contains(&last.message_id));
    if covers_last {
        chat.is_read.insert(user_id.to_string());
    }
}

impl ChatService {
    pub async fn send_message(
        &self,
        actor: &str,
        chat_id: &str,
        request: CreateRequest,
    ) -> AppResult<Message> {
        ensure_self(actor, &request.sender_id)?;

        if request.text.trim().is_empty() && request.image_url.is_empty() {
            return Err(AppError::InvalidArgument(
                "message needs text or an image".to_string(),
            ));
        }

        let message_id = match request.id {
            Some(id) => {
                validate_id("message", &id)?;

                if let Some(existing) = self.existing_message(actor, chat_id, &id).await? {
                    return Ok(existing);
                }

                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let result = self
            .transact(chat_id, |chat| {
                ensure_member(chat, actor)?;

                let message = Message {
                    id: message_id.clone(),
                    chat_id: chat.id.clone(),
                    sender_id: actor.to_string(),
                    text: request.text.clone(),
                    image_url: request.image_url.clone(),
                    sent_at: next_sent_at(chat, DateTime::now()),
                    seen_by: BTreeSet::from([actor.to_string()]),
                };

                let mut next = chat.clone();
                apply_send(&mut next, &message);

                Ok(Staged::Commit {
                    chat: next,
                    append: Some(message.clone()),
                    seen: None,
                    output: message,
                })
            })
            .await;

        match result {
            Ok(message) => {
                info!(chat_id, message_id = %message.id, "message sent");
                Ok(message)
            }
            // a retry of the same send raced us to the insert
            Err(AppError::AlreadyExists(what)) => self
                .existing_message(actor, chat_id, &message_id)
                .await?
                .ok_or(AppError::AlreadyExists(what)),
            Err(err) => Err(err),
        }
    }

    /// A stored message with this id from the same sender, if any.
    async fn existing_message(
        &self,
        actor: &str,
        chat_id: &str,
        message_id: &str,
    ) -> AppResult<Option<Message>> {
        let found = self
            .repo
            .find_messages_by_ids(chat_id, &[message_id.to_string()])
            .await?;

        match found.into_iter().next() {
            Some(message) if message.sender_id == actor => Ok(Some(message)),
            Some(_) => Err(AppError::AlreadyExists(format!("message {message_id}"))),
            None => Ok(None),
        }
    }

    /// Record that the caller saw `message_ids`. Repeating a receipt that
    /// changes nothing does not open a transaction.
    pub async fn mark_seen(
        &self,
        actor: &str,
        chat_id: &str,
        request: SeenRequest,
    ) -> AppResult<SeenResponse> {
        ensure_self(actor, &request.user_id)?;
        self.load_member_chat(actor, chat_id).await?;

        if request.message_ids.is_empty() {
            return Ok(SeenResponse { changed: false });
        }

        let message_ids: Vec<String> = request
            .message_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let found = self
            .repo
            .find_messages_by_ids(chat_id, &message_ids)
            .await?;
        if let Some(missing) = message_ids
            .iter()
            .find(|id| !found.iter().any(|m| &m.id == *id))
        {
            return Err(AppError::NotFound(format!("message {missing}")));
        }

        let all_seen = found.iter().all(|m| m.seen_by.contains(actor));

        self.transact(chat_id, |chat| {
            ensure_member(chat, actor)?;

            let mut next = chat.clone();
            apply_seen(&mut next, actor, &message_ids);

            if all_seen && next == *chat {
                debug!(chat_id, user_id = actor, "seen receipt changes nothing");
                return Ok(Staged::Unchanged(SeenResponse { changed: false }));
            }

            Ok(Staged::Commit {
                chat: next,
                append: None,
                seen: Some(SeenBy {
                    user_id: actor.to_string(),
                    message_ids: message_ids.clone(),
                }),
                output: SeenResponse { changed: true },
            })
        })
        .await
    }
}
