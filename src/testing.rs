//! Fixtures shared by the unit tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use jsonwebtoken::{encode, EncodingKey, Header};
use mongodb::bson::DateTime;
use shared::{
    api::{chat, message, user::Claims},
    models::{
        chat::{Chat, ChatType},
        message::Message,
        user::User,
    },
};

use crate::{
    fanout::{FanoutHandle, FanoutServer},
    service::ChatService,
    store::memory::{MemoryDirectory, MemoryStore},
};

pub const USERS: [&str; 4] = ["A", "B", "C", "D"];

pub fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        name: format!("User {id}"),
        email: format!("{}@example.com", id.to_lowercase()),
        profile_image_url: None,
        about: None,
    }
}

pub fn directory() -> MemoryDirectory {
    MemoryDirectory::new(USERS.map(user))
}

/// Fan-out server running on the current runtime.
pub fn fanout() -> FanoutHandle {
    let (server, handle) = FanoutServer::new(Duration::from_millis(50), 16);
    tokio::spawn(server.run());

    handle
}

pub fn service() -> ChatService {
    ChatService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(directory()),
        fanout(),
        16,
    )
}

pub fn group_chat(id: &str, members: &[&str], admins: &[&str]) -> Chat {
    let set = |ids: &[&str]| ids.iter().map(|id| id.to_string()).collect::<BTreeSet<_>>();

    Chat {
        id: id.to_string(),
        chat_type: ChatType::Group,
        name: "test".to_string(),
        image_url: String::new(),
        member_ids: set(members),
        admins: set(admins),
        created_by: admins.first().unwrap_or(&"A").to_string(),
        created_at: DateTime::from_millis(0),
        bio: String::new(),
        last_message: None,
        is_pinned: BTreeSet::new(),
        is_muted: BTreeSet::new(),
        is_read: BTreeSet::new(),
        unread_count: members
            .iter()
            .map(|id| (id.to_string(), 0))
            .collect::<BTreeMap<_, _>>(),
        version: 0,
    }
}

/// Group created by `creator` with `others` as members.
pub async fn group(service: &ChatService, creator: &str, others: &[&str]) -> Chat {
    service
        .create_chat(
            creator,
            chat::CreateRequest {
                member_ids: others.iter().map(|id| id.to_string()).collect(),
                chat_type: ChatType::Group,
                name: Some("friends".to_string()),
                image_url: None,
            },
        )
        .await
        .unwrap()
}

pub async fn send(service: &ChatService, chat_id: &str, sender: &str, text: &str) -> Message {
    service
        .send_message(
            sender,
            chat_id,
            message::CreateRequest {
                id: None,
                sender_id: sender.to_string(),
                text: text.to_string(),
                image_url: String::new(),
            },
        )
        .await
        .unwrap()
}

pub fn assert_counters_match_members(chat: &Chat) {
    let counted: BTreeSet<&String> = chat.unread_count.keys().collect();
    let members: BTreeSet<&String> = chat.member_ids.iter().collect();

    assert_eq!(counted, members, "unread counters out of sync with members");
    assert!(chat.admins.is_subset(&chat.member_ids));
    assert!(chat.is_read.is_subset(&chat.member_ids));
}

pub const SECRET: &str = "test-secret";

/// Bearer token for `user_id`, signed with [`SECRET`].
pub fn token(user_id: &str) -> String {
    let claims = Claims {
        user_id: user_id.to_string(),
        exp: 4_102_444_800,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}
