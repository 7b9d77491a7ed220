use actix_web::http::header;
use actix_web::{web, HttpResponse, Responder};
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

/// Streams every `trigger_event` notification as an SSE `data:` frame.
pub async fn handler(state: web::Data<AppState>) -> impl Responder {
    let mut receiver = state.kernel.emitter().subscribe();
    log::debug!(
        "Event stream opened, {} client(s)",
        state.kernel.emitter().client_count()
    );

    HttpResponse::Ok()
        .append_header((header::CONTENT_TYPE, "text/event-stream"))
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .append_header((header::CONNECTION, "keep-alive"))
        .streaming(async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(notification) => {
                        let event_json = match serde_json::to_string(&notification) {
                            Ok(json) => json,
                            Err(_) => continue,
                        };
                        let sse_data = format!("data: {}\n\n", event_json);
                        yield Ok::<_, actix_web::Error>(web::Bytes::from(sse_data));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Event stream lagged, skipped {} event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
}
