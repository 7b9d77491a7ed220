//! Orchestration kernel: command registry, event bus, extension lifecycle,
//! and the singleton that composes them for one vault.

pub mod bus;
pub mod chat;
pub mod config;
pub mod error;
pub mod extension;
pub mod frontend;
pub mod kernel;
pub mod lifecycle;
pub mod registry;
pub mod rpc;
pub mod tasks;

pub use bus::{event_handler, EventBus, EventHandler, PublishMode, PublishReport, SubscriptionId};
pub use chat::{ChatClient, ChatPipeline, ChatReply, ChatRequest, EchoClient};
pub use config::{ExtensionConfig, VaultConfig};
pub use error::{KernelError, Result};
pub use extension::{
    Extension, ExtensionCatalog, ExtensionContext, ExtensionFactory, KernelServices,
    SharedExtension, WeakExtensionContext,
};
pub use frontend::FrontendEmitter;
pub use kernel::{Kernel, KernelOptions};
pub use lifecycle::{ExtensionInfo, ExtensionManager};
pub use registry::{command_handler, CommandHandler, CommandRegistry};
pub use rpc::{RpcError, RpcRouter};
pub use tasks::BackgroundTasks;
