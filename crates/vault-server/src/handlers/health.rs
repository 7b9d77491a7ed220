use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::state::AppState;

pub async fn handler(state: web::Data<AppState>) -> impl Responder {
    let kernel = &state.kernel;
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "vault": kernel.vault_path().display().to_string(),
        "extensions": kernel.extensions().loaded_ids(),
        "clients": kernel.emitter().client_count(),
    }))
}
