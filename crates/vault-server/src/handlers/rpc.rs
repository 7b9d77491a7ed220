use actix_web::{web, HttpResponse, Responder};

use crate::state::AppState;

/// One JSON-RPC request per POST. Notifications get `204 No Content`.
pub async fn handler(state: web::Data<AppState>, body: web::Bytes) -> impl Responder {
    let text = String::from_utf8_lossy(&body);
    match state.router.handle_text(&text).await {
        Some(response) => HttpResponse::Ok().json(response),
        None => HttpResponse::NoContent().finish(),
    }
}
