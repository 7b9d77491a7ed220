//! Shared data model and persistence for the vault kernel.
//!
//! Everything the kernel, the branch engine and the built-in extensions agree
//! on lives here: conversation documents, the document store, the JSON-RPC
//! envelope and the well-known constants.

pub mod constants;
pub mod ids;
pub mod rpc;
pub mod store;
pub mod types;

pub use constants::{topics, EventScope, EventType, Severity};
pub use rpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use store::{
    ConversationStore, DocumentGuard, DocumentStore, InMemoryStore, JsonFileStore, StoreError,
    StoreResult,
};
pub use types::{
    Branch, BranchId, ConversationDocument, Message, MessageId, Role, TurnRecord, ROOT_BRANCH_ID,
};
