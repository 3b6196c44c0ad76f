use std::collections::{BTreeMap, BTreeSet};

use bson::DateTime;
use serde::{Deserialize, Serialize};

/// Separator used in the content-derived id of 1:1 chats.
pub const INDIVIDUAL_ID_SEPARATOR: char = '_';

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Individual,
    Group,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub text: String,
    pub sender_id: String,
    pub message_id: String,
    pub at: DateTime,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    pub name: String,
    #[serde(default)]
    pub image_url: String,
    pub member_ids: BTreeSet<String>,
    #[serde(default)]
    pub admins: BTreeSet<String>,
    pub created_by: String,
    pub created_at: DateTime,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub is_pinned: BTreeSet<String>,
    #[serde(default)]
    pub is_muted: BTreeSet<String>,
    #[serde(default)]
    pub is_read: BTreeSet<String>,
    #[serde(default)]
    pub unread_count: BTreeMap<String, u32>,
    /// Bumped on every committed change; used for optimistic concurrency.
    #[serde(default)]
    pub version: i64,
}

impl Chat {
    /// Id of the 1:1 chat between two users, independent of argument order.
    pub fn individual_id(a: &str, b: &str) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };

        format!("{first}{INDIVIDUAL_ID_SEPARATOR}{second}")
    }

    pub fn is_group(&self) -> bool {
        self.chat_type == ChatType::Group
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.member_ids.contains(user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }

    pub fn is_pinned_by(&self, user_id: &str) -> bool {
        self.is_pinned.contains(user_id)
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread_count.get(user_id).copied().unwrap_or(0)
    }

    /// Timestamp used to order chat lists: the last message, or creation.
    pub fn activity_at(&self) -> DateTime {
        self.last_message
            .as_ref()
            .map(|last| last.at)
            .unwrap_or(self.created_at)
    }
}
