use actix_web::{web, Responder};
use shared::api::user::Claims;

use crate::{error::AppResult, service::ChatService};

async fn list(
    service: web::Data<ChatService>,
    user: web::ReqData<Claims>,
) -> AppResult<impl Responder> {
    Ok(web::Json(service.list_users(&user.user_id).await?))
}

async fn get(
    service: web::Data<ChatService>,
    user_id: web::Path<String>,
) -> AppResult<impl Responder> {
    Ok(web::Json(service.get_user(&user_id).await?))
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.route("", web::get().to(list))
        .route("/{user_id}", web::get().to(get));
}
