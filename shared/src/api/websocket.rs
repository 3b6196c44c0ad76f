use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::{
        chat::{CreateRequest, MembersRequest, UpdateRequest},
        message::{self, SeenRequest, SeenResponse},
        snapshot::Snapshot,
    },
    models::{chat::Chat, message::Message},
};

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "t", content = "c")]
pub enum WebsocketServerMessage {
    ChatList {
        subscription: Uuid,
        snapshot: Snapshot<Vec<Chat>>,
    },
    MessageList {
        subscription: Uuid,
        chat_id: String,
        snapshot: Snapshot<Vec<Message>>,
    },
    SubscriptionClosed {
        subscription: Uuid,
    },
    RequestResponse {
        id: Uuid,
        data: Option<WebsocketServerResData>,
        error: Option<String>,
    },
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "t", content = "c")]
pub enum WebsocketServerResData {
    // chat routes
    Chat(Chat),

    // message routes
    NewMessage(Message),
    Seen(SeenResponse),

    // subscriptions
    Subscribed(Uuid),
    Unsubscribed(Uuid),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WebsocketClientMessage {
    pub id: Uuid,
    pub data: WebsocketClientMessageData,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "t", content = "c")]
pub enum WebsocketClientMessageData {
    // chat routes
    CreateChat(CreateRequest),
    UpdateChat {
        chat_id: String,
        update: UpdateRequest,
    },
    TogglePin(String),
    ToggleMute(String),
    UpdateMembers {
        chat_id: String,
        members: MembersRequest,
    },
    ToggleAdmin {
        chat_id: String,
        user_id: String,
    },
    LeaveChat(String),

    // message routes
    NewMessage {
        chat_id: String,
        message: message::CreateRequest,
    },
    MarkSeen {
        chat_id: String,
        seen: SeenRequest,
    },

    // subscriptions
    SubscribeChats,
    SubscribeMessages(String),
    Unsubscribe(Uuid),
}
