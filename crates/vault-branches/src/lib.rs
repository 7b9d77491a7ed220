//! Conversation branching: a tree of named branches over each chat's flat
//! message log, plus the `chat_branches` extension exposing it as commands.

pub mod engine;
pub mod extension;
pub mod naming;
pub mod tree;

pub use engine::{
    BranchEngine, BranchError, BranchListing, BranchResult, BranchSummary, CreateOutcome,
    DeleteOutcome, HistoryOutcome, SwitchOutcome, DEFAULT_CONTINUATION_LABEL,
};
pub use extension::{ChatBranchesExtension, ANNOTATION_PRIORITY, EXTENSION_ID};
pub use naming::{BranchNamer, HeuristicNamer};

use std::sync::Arc;

use vault_kernel::{ExtensionContext, SharedExtension};

/// Catalog factory for the `chat_branches` extension.
pub fn factory(ctx: &ExtensionContext) -> anyhow::Result<SharedExtension> {
    Ok(Arc::new(ChatBranchesExtension::new(ctx)))
}
