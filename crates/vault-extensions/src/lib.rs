//! Built-in extensions: `memory` persists turns, `chat_branches` tags them
//! with the active branch, `topics` indexes them.

pub mod memory;
pub mod topics;

use std::sync::Arc;

use vault_kernel::{ExtensionCatalog, SharedExtension};

pub use memory::MemoryExtension;
pub use topics::{extract_keywords, TopicsExtension};

/// The catalog the server boots with, in discovery order.
pub fn builtin_catalog() -> ExtensionCatalog {
    ExtensionCatalog::new()
        .with(memory::EXTENSION_ID, |ctx| {
            Ok(Arc::new(MemoryExtension::new(ctx)) as SharedExtension)
        })
        .with(vault_branches::EXTENSION_ID, vault_branches::factory)
        .with(topics::EXTENSION_ID, |ctx| {
            Ok(Arc::new(TopicsExtension::new(ctx)) as SharedExtension)
        })
}
