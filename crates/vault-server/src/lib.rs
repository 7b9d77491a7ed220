pub mod handlers;
pub mod logging;
pub mod server;
pub mod state;

pub use server::{app_config, run_server, spawn_ticker};
pub use state::AppState;
