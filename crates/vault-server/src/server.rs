use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tokio::task::JoinHandle;
use vault_kernel::Kernel;

use crate::handlers;
use crate::state::AppState;

pub fn app_config(cfg: &mut web::ServiceConfig) {
    cfg.route("/rpc", web::post().to(handlers::rpc::handler))
        .route("/events", web::get().to(handlers::events::handler))
        .route("/health", web::get().to(handlers::health::handler));
}

pub async fn run_server(kernel: Arc<Kernel>, host: &str, port: u16) -> io::Result<()> {
    let state = web::Data::new(AppState::new(kernel));
    log::info!("Listening on {}:{}", host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Cors::permissive())
            .configure(app_config)
    })
    .bind((host, port))?
    .run()
    .await
}

/// Drives `system:tick` every `tick_interval_secs` until the kernel's
/// shutdown token fires.
pub fn spawn_ticker(kernel: Arc<Kernel>) -> JoinHandle<()> {
    let period = Duration::from_secs(kernel.config().tick_interval_secs.max(1));
    let shutdown = kernel.tasks().shutdown_token();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => kernel.extensions().tick().await,
            }
        }
        log::debug!("Tick loop stopped");
    })
}
