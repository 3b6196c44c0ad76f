use actix_web::{web, HttpResponse, Responder};
use shared::api::{
    message::{CreateRequest, SeenRequest},
    user::Claims,
};

use crate::{error::AppResult, service::ChatService};

use super::{ndjson, FollowQuery};

async fn create(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    request: web::Json<CreateRequest>,
) -> AppResult<impl Responder> {
    let message = service
        .send_message(&user.user_id, &chat_id, request.into_inner())
        .await?;

    Ok(HttpResponse::Created().json(message))
}

async fn list(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    follow: web::Query<FollowQuery>,
) -> AppResult<HttpResponse> {
    if !follow.follow {
        let messages = service.messages(&user.user_id, &chat_id).await?;
        return Ok(HttpResponse::Ok().json(messages));
    }

    let subscription = service.subscribe_messages(&user.user_id, &chat_id).await?;

    Ok(ndjson(subscription))
}

async fn seen(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    request: web::Json<SeenRequest>,
) -> AppResult<impl Responder> {
    let ack = service
        .mark_seen(&user.user_id, &chat_id, request.into_inner())
        .await?;

    Ok(web::Json(ack))
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.route("/{chat_id}/messages", web::get().to(list))
        .route("/{chat_id}/messages", web::post().to(create))
        .route("/{chat_id}/seen", web::post().to(seen));
}
