use std::convert::Infallible;

use actix_web::{web, HttpResponse};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use shared::api::user::Claims;
use tracing::warn;

use crate::{fanout::Subscription, jwt::JwtAuth};

pub mod chat;
pub mod message;
pub mod user;
pub mod websocket;

/// Mounts every authenticated scope.
pub fn config(jwt_auth: JwtAuth<Claims>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.service(
            web::scope("/chats")
                .wrap(jwt_auth.clone())
                .configure(chat::config)
                .configure(message::config),
        )
        .service(
            web::scope("/users")
                .wrap(jwt_auth.clone())
                .configure(user::config),
        )
        .service(
            web::scope("/ws")
                .wrap(jwt_auth)
                .configure(websocket::config),
        );
    }
}

/// `?follow=false` turns a live listing into a one-shot read.
#[derive(Deserialize)]
pub(crate) struct FollowQuery {
    #[serde(default = "follow_default")]
    pub follow: bool,
}

fn follow_default() -> bool {
    true
}

/// Streams every snapshot of a subscription as one JSON line until the
/// client goes away, which drops and thereby cancels the subscription.
pub(crate) fn ndjson<T>(subscription: Subscription<T>) -> HttpResponse
where
    T: Serialize + 'static,
{
    let body = stream::unfold(subscription, |mut subscription| async move {
        let snapshot = subscription.next().await?;

        match serde_json::to_vec(&snapshot) {
            Ok(mut line) => {
                line.push(b'\n');
                Some((Ok::<_, Infallible>(web::Bytes::from(line)), subscription))
            }
            Err(err) => {
                warn!(%err, "failed to encode snapshot; closing stream");
                None
            }
        }
    });

    HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(body)
}
