use std::collections::BTreeSet;

use bson::DateTime;
use serde::{Deserialize, Serialize};

/// Chat list preview used when a message carries only an image.
pub const PHOTO_PREVIEW: &str = "Photo";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub image_url: String,
    pub sent_at: DateTime,
    #[serde(default)]
    pub seen_by: BTreeSet<String>,
}

impl Message {
    /// Text shown as the chat's last message.
    pub fn preview(&self) -> String {
        if self.text.trim().is_empty() && !self.image_url.is_empty() {
            PHOTO_PREVIEW.to_string()
        } else {
            self.text.clone()
        }
    }

    /// Total order within a chat: send time, then id.
    pub fn order_key(&self) -> (DateTime, &str) {
        (self.sent_at, self.id.as_str())
    }
}
