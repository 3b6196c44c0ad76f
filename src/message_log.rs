use shared::models::message::Message;

use crate::{
    error::AppResult,
    fanout::{Subscription, Topic},
    service::{ensure_member, ChatService},
    store::ChatRepository,
};

impl ChatService {
    /// Current messages of a chat, oldest first.
    pub async fn messages(&self, actor: &str, chat_id: &str) -> AppResult<Vec<Message>> {
        member_messages(self.repo.as_ref(), actor, chat_id).await
    }

    /// Live message list. Membership is checked on every re-query, so a
    /// member who leaves stops receiving updates.
    pub async fn subscribe_messages(
        &self,
        actor: &str,
        chat_id: &str,
    ) -> AppResult<Subscription<Vec<Message>>> {
        // fail fast for non-members instead of opening a dead subscription
        self.load_member_chat(actor, chat_id).await?;

        let repo = self.repo.clone();
        let actor = actor.to_string();
        let chat_id = chat_id.to_string();

        self.fanout
            .subscribe(Topic::Messages(chat_id.clone()), move || {
                let repo = repo.clone();
                let actor = actor.clone();
                let chat_id = chat_id.clone();

                async move { member_messages(repo.as_ref(), &actor, &chat_id).await }
            })
            .await
    }
}

async fn member_messages(
    repo: &dyn ChatRepository,
    actor: &str,
    chat_id: &str,
) -> AppResult<Vec<Message>> {
    let chat = repo
        .find_chat(chat_id)
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound(format!("chat {chat_id}")))?;
    ensure_member(&chat, actor)?;

    repo.find_messages(chat_id).await
}
