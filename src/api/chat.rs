use actix_web::{web, HttpResponse, Responder};
use shared::api::{
    chat::{CreateRequest, ListQuery, MembersRequest, UpdateRequest, UserRequest},
    user::Claims,
};

use crate::{error::AppResult, service::ChatService};

use super::{ndjson, FollowQuery};

async fn create(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    request: web::Json<CreateRequest>,
) -> AppResult<impl Responder> {
    let chat = service
        .create_chat(&user.user_id, request.into_inner())
        .await?;

    Ok(HttpResponse::Created().json(chat))
}

async fn list(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    query: web::Query<ListQuery>,
    follow: web::Query<FollowQuery>,
) -> AppResult<HttpResponse> {
    if !follow.follow {
        let chats = service.chats_for_user(&user.user_id, &query.user_id).await?;
        return Ok(HttpResponse::Ok().json(chats));
    }

    let subscription = service
        .subscribe_chats(&user.user_id, &query.user_id)
        .await?;

    Ok(ndjson(subscription))
}

async fn get(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
) -> AppResult<impl Responder> {
    Ok(web::Json(service.get_chat(&user.user_id, &chat_id).await?))
}

async fn update(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    request: web::Json<UpdateRequest>,
) -> AppResult<impl Responder> {
    let chat = service
        .update_chat(&user.user_id, &chat_id, request.into_inner())
        .await?;

    Ok(web::Json(chat))
}

async fn members(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
) -> AppResult<impl Responder> {
    Ok(web::Json(service.chat_members(&user.user_id, &chat_id).await?))
}

async fn update_members(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    request: web::Json<MembersRequest>,
) -> AppResult<impl Responder> {
    let chat = service
        .update_members(&user.user_id, &chat_id, request.into_inner())
        .await?;

    Ok(web::Json(chat))
}

async fn toggle_admin(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    request: web::Json<UserRequest>,
) -> AppResult<impl Responder> {
    let chat = service
        .toggle_admin(&user.user_id, &chat_id, &request.user_id)
        .await?;

    Ok(web::Json(chat))
}

async fn toggle_pin(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    request: web::Json<UserRequest>,
) -> AppResult<impl Responder> {
    let chat = service
        .toggle_pin(&user.user_id, &chat_id, &request.user_id)
        .await?;

    Ok(web::Json(chat))
}

async fn toggle_mute(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
    request: web::Json<UserRequest>,
) -> AppResult<impl Responder> {
    let chat = service
        .toggle_mute(&user.user_id, &chat_id, &request.user_id)
        .await?;

    Ok(web::Json(chat))
}

async fn leave(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
    chat_id: web::Path<String>,
) -> AppResult<impl Responder> {
    Ok(web::Json(service.leave_chat(&user.user_id, &chat_id).await?))
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.route("", web::post().to(create))
        .route("", web::get().to(list))
        .route("/{chat_id}", web::get().to(get))
        .route("/{chat_id}", web::patch().to(update))
        .route("/{chat_id}/members", web::get().to(members))
        .route("/{chat_id}/members", web::post().to(update_members))
        .route("/{chat_id}/admins", web::post().to(toggle_admin))
        .route("/{chat_id}/pin", web::post().to(toggle_pin))
        .route("/{chat_id}/mute", web::post().to(toggle_mute))
        .route("/{chat_id}/leave", web::post().to(leave));
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test, App};
    use serde_json::json;
    use shared::models::chat::Chat;

    use super::*;
    use crate::{
        api::{self, tests::authed, tests::next_snapshot},
        jwt::JwtAuth,
        testing,
    };

    #[actix_web::test]
    async fn create_then_fetch_a_group() {
        let service = web::Data::new(testing::service());
        let app = test::init_service(
            App::new()
                .app_data(service.clone())
                .configure(api::config(JwtAuth::new(testing::SECRET))),
        )
        .await;

        let req = authed(test::TestRequest::post().uri("/chats"), "A")
            .set_json(json!({ "memberIds": ["B", "C"], "type": "group", "name": "trip" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let chat: Chat = test::read_body_json(resp).await;
        assert_eq!(chat.name, "trip");

        let req = authed(test::TestRequest::get().uri(&format!("/chats/{}", chat.id)), "B")
            .to_request();
        let fetched: Chat = test::call_and_read_body_json(&app, req).await;
        assert_eq!(fetched, chat);

        let req = authed(test::TestRequest::get().uri(&format!("/chats/{}", chat.id)), "D")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn non_admin_edits_are_forbidden() {
        let service = web::Data::new(testing::service());
        let chat = testing::group(&service, "A", &["B"]).await;
        let app = test::init_service(
            App::new()
                .app_data(service.clone())
                .configure(api::config(JwtAuth::new(testing::SECRET))),
        )
        .await;

        let req = authed(
            test::TestRequest::post().uri(&format!("/chats/{}/members", chat.id)),
            "B",
        )
        .set_json(json!({ "add": ["C"] }))
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Unauthorized");
    }

    #[actix_web::test]
    async fn pin_for_someone_else_is_forbidden() {
        let service = web::Data::new(testing::service());
        let chat = testing::group(&service, "A", &["B"]).await;
        let app = test::init_service(
            App::new()
                .app_data(service.clone())
                .configure(api::config(JwtAuth::new(testing::SECRET))),
        )
        .await;

        let uri = format!("/chats/{}/pin", chat.id);

        let req = authed(test::TestRequest::post().uri(&uri), "A")
            .set_json(json!({ "userId": "B" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = authed(test::TestRequest::post().uri(&uri), "A")
            .set_json(json!({ "userId": "A" }))
            .to_request();
        let pinned: Chat = test::call_and_read_body_json(&app, req).await;
        assert!(pinned.is_pinned_by("A"));
    }

    #[actix_web::test]
    async fn chat_list_streams_new_snapshots() {
        let service = web::Data::new(testing::service());
        let app = test::init_service(
            App::new()
                .app_data(service.clone())
                .configure(api::config(JwtAuth::new(testing::SECRET))),
        )
        .await;

        let req = authed(test::TestRequest::get().uri("/chats?userId=B"), "B").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body();

        let first = next_snapshot::<Vec<Chat>>(&mut body).await;
        assert_eq!(first.generation, 1);
        assert!(first.items.is_empty());

        let chat = testing::group(&service, "A", &["B"]).await;

        let second = next_snapshot::<Vec<Chat>>(&mut body).await;
        assert_eq!(second.generation, 2);
        assert_eq!(second.items, vec![chat]);
    }

    #[actix_web::test]
    async fn one_shot_listing_and_foreign_lists() {
        let service = web::Data::new(testing::service());
        testing::group(&service, "A", &["B"]).await;
        let app = test::init_service(
            App::new()
                .app_data(service.clone())
                .configure(api::config(JwtAuth::new(testing::SECRET))),
        )
        .await;

        let req = authed(
            test::TestRequest::get().uri("/chats?userId=B&follow=false"),
            "B",
        )
        .to_request();
        let chats: Vec<Chat> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(chats.len(), 1);

        let req = authed(
            test::TestRequest::get().uri("/chats?userId=A&follow=false"),
            "B",
        )
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
