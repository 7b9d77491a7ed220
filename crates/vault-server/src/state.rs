use std::sync::Arc;

use vault_kernel::{Kernel, RpcRouter};

/// Shared by every worker of the HTTP server.
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub router: RpcRouter,
}

impl AppState {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            router: RpcRouter::new(kernel.clone()),
            kernel,
        }
    }
}
