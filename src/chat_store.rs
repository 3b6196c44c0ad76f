use std::collections::{BTreeMap, BTreeSet};

use mongodb::bson::DateTime;
use shared::{
    api::chat::{CreateRequest, MembersRequest, UpdateRequest},
    models::{
        chat::{Chat, ChatType},
        user::User,
    },
};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    fanout::{Subscription, Topic},
    service::{ensure_member, ensure_self, validate_id, ChatService, Staged},
    store::ChatRepository,
};

pub const DEFAULT_GROUP_NAME: &str = "New Group Chat";

impl ChatService {
    /// Start a chat. 1:1 chats are keyed by their member pair, so starting
    /// the same conversation twice returns the existing chat.
    pub async fn create_chat(&self, actor: &str, request: CreateRequest) -> AppResult<Chat> {
        let mut member_ids: BTreeSet<String> = request.member_ids.iter().cloned().collect();
        member_ids.insert(actor.to_string());

        for id in &member_ids {
            validate_id("user", id)?;
        }

        let ids: Vec<String> = member_ids.iter().cloned().collect();
        let known = self.directory.find_users(&ids).await?;
        if let Some(missing) = ids.iter().find(|id| !known.iter().any(|u| &u.id == *id)) {
            return Err(AppError::NotFound(format!("user {missing}")));
        }

        let chat = new_chat(actor, member_ids, &request, DateTime::now())?;

        match self.repo.insert_chat(&chat).await {
            Ok(()) => {
                info!(chat_id = %chat.id, members = chat.member_ids.len(), "chat created");

                self.announce_created(&chat);

                Ok(chat)
            }
            Err(AppError::AlreadyExists(what)) if chat.chat_type == ChatType::Individual => {
                let existing = self.load_chat(&chat.id).await?;

                if existing.member_ids == chat.member_ids {
                    Ok(existing)
                } else {
                    Err(AppError::AlreadyExists(what))
                }
            }
            Err(err) => Err(err),
        }
    }

    fn announce_created(&self, chat: &Chat) {
        self.fanout.publish(crate::fanout::ChangeEvent {
            chat_id: chat.id.clone(),
            user_ids: chat.member_ids.iter().cloned().collect(),
            messages_changed: false,
        });
    }

    pub async fn get_chat(&self, actor: &str, chat_id: &str) -> AppResult<Chat> {
        self.load_member_chat(actor, chat_id).await
    }

    pub async fn chats_for_user(&self, actor: &str, user_id: &str) -> AppResult<Vec<Chat>> {
        ensure_self(actor, user_id)?;

        chats_for(self.repo.as_ref(), user_id).await
    }

    pub async fn subscribe_chats(
        &self,
        actor: &str,
        user_id: &str,
    ) -> AppResult<Subscription<Vec<Chat>>> {
        ensure_self(actor, user_id)?;

        let repo = self.repo.clone();
        let user_id = user_id.to_string();

        self.fanout
            .subscribe(Topic::Chats(user_id.clone()), move || {
                let repo = repo.clone();
                let user_id = user_id.clone();

                async move { chats_for(repo.as_ref(), &user_id).await }
            })
            .await
    }

    /// Edit group info. Runs as a versioned transaction, so concurrent
    /// edits serialize instead of overwriting each other.
    pub async fn update_chat(
        &self,
        actor: &str,
        chat_id: &str,
        update: UpdateRequest,
    ) -> AppResult<Chat> {
        self.transact(chat_id, |chat| {
            ensure_admin(chat, actor)?;

            let mut next = chat.clone();
            if let Some(name) = update.name.as_ref().filter(|name| !name.is_empty()) {
                next.name = name.clone();
            }
            if let Some(bio) = &update.bio {
                next.bio = bio.clone();
            }
            if let Some(image_url) = &update.image_url {
                next.image_url = image_url.clone();
            }

            Ok(commit_if_changed(chat, next))
        })
        .await
    }

    pub async fn toggle_pin(&self, actor: &str, chat_id: &str, user_id: &str) -> AppResult<Chat> {
        ensure_self(actor, user_id)?;

        self.transact(chat_id, |chat| {
            ensure_member(chat, actor)?;

            let mut next = chat.clone();
            toggle(&mut next.is_pinned, user_id);

            Ok(Staged::chat(next.clone(), next))
        })
        .await
    }

    pub async fn toggle_mute(&self, actor: &str, chat_id: &str, user_id: &str) -> AppResult<Chat> {
        ensure_self(actor, user_id)?;

        self.transact(chat_id, |chat| {
            ensure_member(chat, actor)?;

            let mut next = chat.clone();
            toggle(&mut next.is_muted, user_id);

            Ok(Staged::chat(next.clone(), next))
        })
        .await
    }

    /// Add and remove members in one transaction. Admins may edit anyone;
    /// other members may only remove themselves.
    pub async fn update_members(
        &self,
        actor: &str,
        chat_id: &str,
        request: MembersRequest,
    ) -> AppResult<Chat> {
        for id in request.add.iter().chain(request.remove.iter()) {
            validate_id("user", id)?;
        }

        if !request.add.is_empty() {
            let known = self.directory.find_users(&request.add).await?;
            if let Some(missing) = request
                .add
                .iter()
                .find(|id| !known.iter().any(|u| &u.id == *id))
            {
                return Err(AppError::NotFound(format!("user {missing}")));
            }
        }

        self.transact(chat_id, |chat| {
            ensure_member(chat, actor)?;

            if !chat.is_group() {
                return Err(AppError::InvalidArgument(
                    "membership of 1:1 chats is fixed".to_string(),
                ));
            }

            let self_removal_only = request.add.is_empty()
                && !request.remove.is_empty()
                && request.remove.iter().all(|id| id == actor);
            if !self_removal_only {
                ensure_admin(chat, actor)?;
            }

            let mut next = chat.clone();
            add_members(&mut next, &request.add);
            for user_id in &request.remove {
                remove_member(&mut next, user_id)?;
            }

            Ok(commit_if_changed(chat, next))
        })
        .await
    }

    /// Exit a group.
    pub async fn leave_chat(&self, actor: &str, chat_id: &str) -> AppResult<Chat> {
        self.update_members(
            actor,
            chat_id,
            MembersRequest {
                add: Vec::new(),
                remove: vec![actor.to_string()],
            },
        )
        .await
    }

    pub async fn toggle_admin(&self, actor: &str, chat_id: &str, user_id: &str) -> AppResult<Chat> {
        self.transact(chat_id, |chat| {
            ensure_member(chat, actor)?;
            ensure_admin(chat, actor)?;

            let mut next = chat.clone();
            toggle_admin(&mut next, user_id)?;

            Ok(Staged::chat(next.clone(), next))
        })
        .await
    }

    /// Profiles of the chat's members.
    pub async fn chat_members(&self, actor: &str, chat_id: &str) -> AppResult<Vec<User>> {
        let chat = self.load_member_chat(actor, chat_id).await?;
        let ids: Vec<String> = chat.member_ids.into_iter().collect();

        self.directory.find_users(&ids).await
    }

    /// Directory listing for the new-chat screen, without the caller.
    pub async fn list_users(&self, actor: &str) -> AppResult<Vec<User>> {
        let mut users = self.directory.list_users().await?;
        users.retain(|user| user.id != actor);

        Ok(users)
    }

    pub async fn get_user(&self, user_id: &str) -> AppResult<User> {
        self.directory.get_user(user_id).await
    }
}

/// Member chats, pinned by `user_id` first, then most recent activity.
pub async fn chats_for(repo: &dyn ChatRepository, user_id: &str) -> AppResult<Vec<Chat>> {
    let mut chats = repo.find_chats_for_member(user_id).await?;
    sort_for_user(&mut chats, user_id);

    Ok(chats)
}

pub fn sort_for_user(chats: &mut [Chat], user_id: &str) {
    chats.sort_by(|a, b| {
        b.is_pinned_by(user_id)
            .cmp(&a.is_pinned_by(user_id))
            .then_with(|| b.activity_at().cmp(&a.activity_at()))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn new_chat(
    creator: &str,
    member_ids: BTreeSet<String>,
    request: &CreateRequest,
    now: DateTime,
) -> AppResult<Chat> {
    let (id, name, admins) = match request.chat_type {
        ChatType::Individual => {
            let mut members = member_ids.iter();
            let (Some(a), Some(b), None) = (members.next(), members.next(), members.next()) else {
                return Err(AppError::InvalidArgument(
                    "1:1 chats need exactly two distinct members".to_string(),
                ));
            };

            (Chat::individual_id(a, b), String::new(), BTreeSet::new())
        }
        ChatType::Group => {
            if member_ids.len() < 2 {
                return Err(AppError::InvalidArgument(
                    "a group needs at least one other member".to_string(),
                ));
            }

            let name = request
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(DEFAULT_GROUP_NAME.to_string());

            (
                Uuid::new_v4().to_string(),
                name,
                BTreeSet::from([creator.to_string()]),
            )
        }
    };

    let unread_count: BTreeMap<String, u32> =
        member_ids.iter().map(|id| (id.clone(), 0)).collect();

    Ok(Chat {
        id,
        chat_type: request.chat_type,
        name,
        image_url: request.image_url.clone().unwrap_or_default(),
        member_ids,
        admins,
        created_by: creator.to_string(),
        created_at: now,
        bio: String::new(),
        last_message: None,
        is_pinned: BTreeSet::new(),
        is_muted: BTreeSet::new(),
        is_read: BTreeSet::new(),
        unread_count,
        version: 0,
    })
}

fn commit_if_changed(current: &Chat, next: Chat) -> Staged<Chat> {
    if &next == current {
        Staged::Unchanged(next)
    } else {
        Staged::chat(next.clone(), next)
    }
}

fn ensure_admin(chat: &Chat, user_id: &str) -> AppResult<()> {
    ensure_member(chat, user_id)?;

    if !chat.is_group() {
        return Err(AppError::InvalidArgument(
            "1:1 chats have no admins".to_string(),
        ));
    }

    if chat.is_admin(user_id) {
        Ok(())
    } else {
        Err(AppError::Unauthorized("admin only".to_string()))
    }
}

fn toggle(set: &mut BTreeSet<String>, user_id: &str) {
    if !set.remove(user_id) {
        set.insert(user_id.to_string());
    }
}

/// New members start with a zero unread counter. Existing members are kept as-is.
fn add_members(chat: &mut Chat, user_ids: &[String]) {
    for user_id in user_ids {
        if chat.member_ids.insert(user_id.clone()) {
            chat.unread_count.insert(user_id.clone(), 0);
        }
    }
}

/// Drops the member and every per-user flag or counter they had. A group
/// must keep at least one member, and at least one admin while it has
/// members.
fn remove_member(chat: &mut Chat, user_id: &str) -> AppResult<()> {
    if !chat.is_member(user_id) {
        return Err(AppError::NotFound(format!("member {user_id}")));
    }

    if chat.member_ids.len() == 1 {
        return Err(AppError::InvalidArgument(
            "cannot remove the last member".to_string(),
        ));
    }

    if chat.admins.len() == 1 && chat.is_admin(user_id) {
        return Err(AppError::InvalidArgument(
            "cannot remove the last admin; appoint another admin first".to_string(),
        ));
    }

    chat.member_ids.remove(user_id);
    chat.admins.remove(user_id);
    chat.is_pinned.remove(user_id);
    chat.is_muted.remove(user_id);
    chat.is_read.remove(user_id);
    chat.unread_count.remove(user_id);

    Ok(())
}

fn toggle_admin(chat: &mut Chat, user_id: &str) -> AppResult<()> {
    if !chat.is_member(user_id) {
        return Err(AppError::NotFound(format!("member {user_id}")));
    }

    if chat.is_admin(user_id) {
        if chat.admins.len() == 1 {
            return Err(AppError::InvalidArgument(
                "a group needs at least one admin".to_string(),
            ));
        }

        chat.admins.remove(user_id);
    } else {
        chat.admins.insert(user_id.to_string());
    }

    Ok(())
}
