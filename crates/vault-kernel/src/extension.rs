use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use vault_core::ConversationStore;

use crate::bus::{EventBus, EventHandler, PublishMode, PublishReport, SubscriptionId};
use crate::error::Result;
use crate::frontend::FrontendEmitter;
use crate::registry::{CommandHandler, CommandRegistry};
use crate::tasks::BackgroundTasks;

/// A loadable unit contributing commands and event subscribers.
///
/// `register_commands` must only register commands. Subscriptions and
/// overrides belong in `on_load`, which runs once every extension has
/// registered.
#[async_trait]
pub trait Extension: Send + Sync {
    fn id(&self) -> &str;

    fn register_commands(&self, ctx: &ExtensionContext) -> anyhow::Result<()>;

    async fn on_load(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unload(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_client_connected(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tick(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SharedExtension = Arc<dyn Extension>;

/// Shared kernel handles every extension context is cut from.
#[derive(Clone)]
pub struct KernelServices {
    pub vault_path: PathBuf,
    pub registry: Arc<CommandRegistry>,
    pub bus: Arc<EventBus>,
    pub store: ConversationStore,
    pub emitter: FrontendEmitter,
    pub tasks: BackgroundTasks,
}

/// The handle an extension gets instead of the global kernel.
///
/// Commands and subscriptions made through it are tagged with the
/// extension id, which is what unload tears down.
#[derive(Clone)]
pub struct ExtensionContext {
    extension_id: String,
    settings: Value,
    services: KernelServices,
}

impl ExtensionContext {
    pub fn new(extension_id: impl Into<String>, settings: Value, services: KernelServices) -> Self {
        Self {
            extension_id: extension_id.into(),
            settings,
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.extension_id
    }

    pub fn settings(&self) -> &Value {
        &self.settings
    }

    pub fn setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn vault_path(&self) -> &Path {
        &self.services.vault_path
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.services.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn store(&self) -> &ConversationStore {
        &self.services.store
    }

    pub fn emitter(&self) -> &FrontendEmitter {
        &self.services.emitter
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.services.tasks
    }

    pub fn register_command(&self, id: &str, handler: CommandHandler) -> Result<()> {
        self.services
            .registry
            .register(id, handler, &self.extension_id, false)
    }

    /// Replaces a command owned by another extension.
    pub fn override_command(&self, id: &str, handler: CommandHandler) -> Result<()> {
        self.services
            .registry
            .register(id, handler, &self.extension_id, true)
    }

    pub async fn execute(&self, command: &str, args: Value) -> Result<Value> {
        self.services.registry.execute(command, args).await
    }

    pub fn subscribe(&self, topic: &str, priority: i32, handler: EventHandler) -> SubscriptionId {
        self.services
            .bus
            .subscribe(topic, &self.extension_id, priority, handler)
    }

    pub async fn publish(&self, topic: &str, payload: Value, mode: PublishMode) -> PublishReport {
        self.services.bus.publish(topic, payload, mode).await
    }

    pub fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.services
            .tasks
            .spawn(format!("{}:{}", self.extension_id, name), future)
    }

    /// A handle that does not keep the registry or the bus alive. Handlers
    /// stored in either must capture this instead of the context itself.
    pub fn downgrade(&self) -> WeakExtensionContext {
        WeakExtensionContext {
            extension_id: self.extension_id.clone(),
            settings: self.settings.clone(),
            vault_path: self.services.vault_path.clone(),
            registry: Arc::downgrade(&self.services.registry),
            bus: Arc::downgrade(&self.services.bus),
            store: self.services.store.clone(),
            emitter: self.services.emitter.clone(),
            tasks: self.services.tasks.clone(),
        }
    }
}

#[derive(Clone)]
pub struct WeakExtensionContext {
    extension_id: String,
    settings: Value,
    vault_path: PathBuf,
    registry: Weak<CommandRegistry>,
    bus: Weak<EventBus>,
    store: ConversationStore,
    emitter: FrontendEmitter,
    tasks: BackgroundTasks,
}

impl WeakExtensionContext {
    /// `None` once the kernel owning the registry and bus is gone.
    pub fn upgrade(&self) -> Option<ExtensionContext> {
        let services = KernelServices {
            vault_path: self.vault_path.clone(),
            registry: self.registry.upgrade()?,
            bus: self.bus.upgrade()?,
            store: self.store.clone(),
            emitter: self.emitter.clone(),
            tasks: self.tasks.clone(),
        };
        Some(ExtensionContext::new(
            self.extension_id.clone(),
            self.settings.clone(),
            services,
        ))
    }
}

/// Builds an extension instance; the context is the one it will be
/// registered and activated with.
pub type ExtensionFactory =
    Arc<dyn Fn(&ExtensionContext) -> anyhow::Result<SharedExtension> + Send + Sync>;

/// Ordered set of constructible extensions. Discovery order is
/// registration order.
#[derive(Clone, Default)]
pub struct ExtensionCatalog {
    entries: Vec<(String, ExtensionFactory)>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id`, replacing an existing factory in place.
    pub fn register<F>(&mut self, id: &str, factory: F) -> &mut Self
    where
        F: Fn(&ExtensionContext) -> anyhow::Result<SharedExtension> + Send + Sync + 'static,
    {
        let factory: ExtensionFactory = Arc::new(factory);
        match self.entries.iter_mut().find(|(existing, _)| existing == id) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((id.to_string(), factory)),
        }
        self
    }

    pub fn with<F>(mut self, id: &str, factory: F) -> Self
    where
        F: Fn(&ExtensionContext) -> anyhow::Result<SharedExtension> + Send + Sync + 'static,
    {
        self.register(id, factory);
        self
    }

    pub fn factory(&self, id: &str) -> Option<ExtensionFactory> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, factory)| factory.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|(existing, _)| existing == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
