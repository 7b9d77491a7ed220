use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use serde_json::{json, Value};
use vault_core::constants::{CORE_OWNER, MEMORY_DIR};
use vault_core::{topics, ConversationStore, JsonFileStore};

use crate::bus::{EventBus, PublishMode};
use crate::chat::{ChatClient, ChatPipeline, ChatRequest, EchoClient};
use crate::config::{validate_vault_path, VaultConfig};
use crate::error::{KernelError, Result};
use crate::extension::{ExtensionCatalog, KernelServices};
use crate::frontend::FrontendEmitter;
use crate::lifecycle::ExtensionManager;
use crate::registry::{command_handler, CommandRegistry};
use crate::tasks::BackgroundTasks;

static KERNEL: OnceLock<Arc<Kernel>> = OnceLock::new();

/// Everything needed to build a kernel.
pub struct KernelOptions {
    pub vault_path: PathBuf,
    pub catalog: ExtensionCatalog,
    pub chat_client: Arc<dyn ChatClient>,
}

impl KernelOptions {
    pub fn new(vault_path: impl Into<PathBuf>) -> Self {
        Self {
            vault_path: vault_path.into(),
            catalog: ExtensionCatalog::new(),
            chat_client: Arc::new(EchoClient),
        }
    }

    pub fn with_catalog(mut self, catalog: ExtensionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_chat_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.chat_client = client;
        self
    }
}

/// The orchestrator: command registry, event bus and extension lifecycle
/// for one vault.
pub struct Kernel {
    vault_path: PathBuf,
    config: Arc<RwLock<VaultConfig>>,
    registry: Arc<CommandRegistry>,
    bus: Arc<EventBus>,
    store: ConversationStore,
    emitter: FrontendEmitter,
    tasks: BackgroundTasks,
    extensions: Arc<ExtensionManager>,
    chat: ChatPipeline,
    initialized: AtomicBool,
}

impl Kernel {
    /// Creates the process-wide kernel once. Later calls return the existing
    /// instance untouched.
    pub fn init(options: KernelOptions) -> Result<Arc<Kernel>> {
        if let Some(existing) = KERNEL.get() {
            warn_if_different(existing, &options.vault_path);
            return Ok(existing.clone());
        }

        let kernel = Kernel::new(options)?;
        match KERNEL.set(kernel.clone()) {
            Ok(()) => Ok(kernel),
            Err(_) => {
                let existing = KERNEL.get().cloned().ok_or(KernelError::NotInitialized)?;
                warn_if_different(&existing, &kernel.vault_path);
                Ok(existing)
            }
        }
    }

    pub fn get() -> Result<Arc<Kernel>> {
        KERNEL.get().cloned().ok_or(KernelError::NotInitialized)
    }

    /// Builds a standalone kernel that is not registered globally.
    pub fn new(options: KernelOptions) -> Result<Arc<Kernel>> {
        let vault_path = validate_vault_path(&options.vault_path)?;
        let config = VaultConfig::load(&vault_path)?;

        let memory_dir = vault_path.join(MEMORY_DIR);
        std::fs::create_dir_all(&memory_dir)?;

        let config = Arc::new(RwLock::new(config));
        let registry = Arc::new(CommandRegistry::new());
        let bus = Arc::new(EventBus::new());
        let store = ConversationStore::new(Arc::new(JsonFileStore::new(&memory_dir)));
        let emitter = FrontendEmitter::new();
        let tasks = BackgroundTasks::new();

        let services = KernelServices {
            vault_path: vault_path.clone(),
            registry: registry.clone(),
            bus: bus.clone(),
            store: store.clone(),
            emitter: emitter.clone(),
            tasks: tasks.clone(),
        };
        let extensions = Arc::new(ExtensionManager::new(
            options.catalog,
            services,
            config.clone(),
        ));
        let chat = ChatPipeline::new(options.chat_client, bus.clone());

        log::info!("Kernel created for vault {}", vault_path.display());
        Ok(Arc::new(Kernel {
            vault_path,
            config,
            registry,
            bus,
            store,
            emitter,
            tasks,
            extensions,
            chat,
            initialized: AtomicBool::new(false),
        }))
    }

    /// Registers the core commands and loads every enabled extension.
    /// Returns the ids that came up.
    pub async fn initialize(self: &Arc<Self>) -> Result<Vec<String>> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            log::warn!("Kernel already initialized");
            return Ok(self.extensions.loaded_ids());
        }

        self.register_core_commands()?;
        let loaded = self.extensions.load_all().await;

        self.bus
            .publish(
                topics::SYSTEM_READY,
                json!({ "vault": self.vault_path.display().to_string(), "extensions": loaded }),
                PublishMode::Sequential,
            )
            .await;
        log::info!(
            "Kernel ready: {} command(s), {} extension(s)",
            self.registry.len(),
            loaded.len()
        );
        Ok(loaded)
    }

    pub async fn shutdown(&self) {
        log::info!("Kernel shutting down");
        self.bus
            .publish(topics::SYSTEM_SHUTDOWN, json!({}), PublishMode::Sequential)
            .await;
        self.extensions.unload_all().await;
        self.tasks.shutdown().await;
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }

    pub fn config(&self) -> VaultConfig {
        self.config.read().clone()
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn emitter(&self) -> &FrontendEmitter {
        &self.emitter
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn extensions(&self) -> &Arc<ExtensionManager> {
        &self.extensions
    }

    pub fn chat(&self) -> &ChatPipeline {
        &self.chat
    }

    pub async fn execute(&self, command: &str, args: Value) -> Result<Value> {
        self.registry.execute(command, args).await
    }

    pub fn vault_info(&self) -> Value {
        let config = self.config.read();
        json!({
            "id": config.id,
            "name": config.name,
            "version": config.version,
            "path": self.vault_path.display().to_string(),
            "extensions": self.extensions.loaded_ids(),
            "commands": self.registry.len(),
        })
    }

    fn register_core_commands(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);

        self.register_core("system.chat", weak.clone(), |kernel, args| async move {
            let request: ChatRequest = serde_json::from_value(args)?;
            Ok(serde_json::to_value(kernel.chat.send(request).await?)?)
        })?;

        self.register_core("system.list_commands", weak.clone(), |kernel, _| async move {
            Ok(json!({ "commands": kernel.registry.list() }))
        })?;

        self.register_core("system.info", weak.clone(), |kernel, _| async move {
            Ok(kernel.vault_info())
        })?;

        self.register_core("plugins.list", weak.clone(), |kernel, _| async move {
            Ok(json!({ "status": "success", "plugins": kernel.extensions.list() }))
        })?;

        self.register_core("plugins.unload", weak.clone(), |kernel, args| async move {
            let id = plugin_id(&args)?;
            Ok(lifecycle_status(&id, kernel.extensions.unload(&id).await))
        })?;

        self.register_core("plugins.reload", weak.clone(), |kernel, args| async move {
            let id = plugin_id(&args)?;
            Ok(lifecycle_status(&id, kernel.extensions.reload(&id).await))
        })?;

        self.register_core("plugins.toggle", weak, |kernel, args| async move {
            let id = plugin_id(&args)?;
            let enabled = args
                .get("enabled")
                .and_then(Value::as_bool)
                .ok_or_else(|| anyhow::anyhow!("'enabled' must be a boolean"))?;
            let mut status = lifecycle_status(&id, kernel.extensions.toggle(&id, enabled).await);
            status["enabled"] = json!(enabled);
            Ok(status)
        })?;

        Ok(())
    }

    fn register_core<F, Fut>(&self, id: &str, kernel: Weak<Kernel>, f: F) -> Result<()>
    where
        F: Fn(Arc<Kernel>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = command_handler(move |args| {
            let kernel = kernel.upgrade();
            let f = f.clone();
            async move {
                let kernel = kernel.ok_or_else(|| anyhow::anyhow!("kernel dropped"))?;
                f(kernel, args).await
            }
        });
        self.registry.register(id, handler, CORE_OWNER, false)
    }
}

fn warn_if_different(existing: &Kernel, requested: &Path) {
    let requested = requested
        .canonicalize()
        .unwrap_or_else(|_| requested.to_path_buf());
    if requested != existing.vault_path {
        log::warn!(
            "Kernel already initialized for {}, ignoring {}",
            existing.vault_path.display(),
            requested.display()
        );
    }
}

fn plugin_id(args: &Value) -> anyhow::Result<String> {
    args.get("plugin_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("'plugin_id' is required"))
}

fn lifecycle_status(id: &str, outcome: Result<()>) -> Value {
    match outcome {
        Ok(()) => json!({ "status": "success", "plugin_id": id }),
        Err(e) => json!({ "status": "error", "plugin_id": id, "error": e.to_string() }),
    }
}
