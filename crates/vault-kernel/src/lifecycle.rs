use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use vault_core::topics;

use crate::bus::{event_handler, PublishMode};
use crate::config::VaultConfig;
use crate::error::{KernelError, Result};
use crate::extension::{ExtensionCatalog, ExtensionContext, KernelServices, SharedExtension};
use crate::registry::panic_message;

struct LoadedExtension {
    id: String,
    instance: SharedExtension,
    context: ExtensionContext,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub id: String,
    pub loaded: bool,
    pub enabled: bool,
}

/// Owns the loaded extensions and every lifecycle transition.
///
/// All transitions run under one async mutex, so loads, unloads and reloads
/// never interleave.
pub struct ExtensionManager {
    catalog: ExtensionCatalog,
    services: KernelServices,
    config: Arc<RwLock<VaultConfig>>,
    loaded: RwLock<Vec<LoadedExtension>>,
    lifecycle: Mutex<()>,
}

impl ExtensionManager {
    pub fn new(
        catalog: ExtensionCatalog,
        services: KernelServices,
        config: Arc<RwLock<VaultConfig>>,
    ) -> Self {
        Self {
            catalog,
            services,
            config,
            loaded: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &ExtensionCatalog {
        &self.catalog
    }

    /// Two-phase load of every enabled catalog entry not loaded yet.
    pub async fn load_all(&self) -> Vec<String> {
        let _guard = self.lifecycle.lock().await;

        let candidates: Vec<String> = {
            let config = self.config.read();
            self.catalog
                .ids()
                .into_iter()
                .filter(|id| {
                    let enabled = config.is_enabled(id);
                    if !enabled {
                        log::info!("[plugin:{}] disabled in vault config, skipping", id);
                    }
                    enabled
                })
                .filter(|id| !self.is_loaded(id))
                .collect()
        };

        let mut registered = Vec::new();
        for id in candidates {
            match self.instantiate_and_register(&id) {
                Ok(entry) => registered.push(entry),
                Err(e) => log::error!("[plugin:{}] registration failed: {}", id, e),
            }
        }

        let mut activated = Vec::new();
        for entry in registered {
            let id = entry.id.clone();
            match self.activate(entry).await {
                Ok(()) => activated.push(id),
                Err(e) => log::error!("[plugin:{}] activation failed: {}", id, e),
            }
        }
        drop(_guard);

        for id in &activated {
            self.announce(topics::PLUGIN_LOADED, id).await;
        }
        log::info!("Loaded {} extension(s): {:?}", activated.len(), activated);
        activated
    }

    pub async fn unload(&self, id: &str) -> Result<()> {
        {
            let _guard = self.lifecycle.lock().await;
            self.unload_locked(id).await?;
        }
        self.announce(topics::PLUGIN_UNLOADED, id).await;
        Ok(())
    }

    /// Tears `id` down (when loaded) and builds it again from its factory
    /// with freshly read settings.
    pub async fn reload(&self, id: &str) -> Result<()> {
        {
            let _guard = self.lifecycle.lock().await;
            if !self.catalog.contains(id) {
                return Err(KernelError::ExtensionNotFound(id.to_string()));
            }
            if self.is_loaded(id) {
                self.unload_locked(id).await?;
            }
            self.refresh_config();

            let entry = self.instantiate_and_register(id)?;
            self.activate(entry).await?;
        }
        self.announce(topics::PLUGIN_LOADED, id).await;
        log::info!("[plugin:{}] reloaded", id);
        Ok(())
    }

    /// Persists the enabled flag; takes effect on the next boot or reload.
    pub async fn toggle(&self, id: &str, enabled: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.catalog.contains(id) {
            return Err(KernelError::ExtensionNotFound(id.to_string()));
        }

        let updated = {
            let mut config = self.config.write();
            config.set_enabled(id, enabled);
            config.clone()
        };
        updated.save(&self.services.vault_path).await?;
        log::info!("[plugin:{}] enabled = {}", id, enabled);
        Ok(())
    }

    pub async fn client_connected(&self) {
        for (id, instance, context) in self.snapshot() {
            if let Err(e) = guarded(instance.on_client_connected(&context)).await {
                log::error!("[plugin:{}] on_client_connected failed: {}", id, e);
            }
        }
    }

    pub async fn tick(&self) {
        let payload = json!({ "timestamp": chrono::Utc::now().to_rfc3339() });
        self.services
            .bus
            .publish(topics::SYSTEM_TICK, payload, PublishMode::Sequential)
            .await;
    }

    /// Unloads everything, newest first.
    pub async fn unload_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let ids: Vec<String> = self.loaded.read().iter().rev().map(|e| e.id.clone()).collect();
        for id in ids {
            if let Err(e) = self.unload_locked(&id).await {
                log::error!("[plugin:{}] unload failed: {}", id, e);
            }
        }
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded.read().iter().any(|e| e.id == id)
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        self.loaded.read().iter().map(|e| e.id.clone()).collect()
    }

    pub fn list(&self) -> Vec<ExtensionInfo> {
        let config = self.config.read();
        self.catalog
            .ids()
            .into_iter()
            .map(|id| ExtensionInfo {
                loaded: self.is_loaded(&id),
                enabled: config.is_enabled(&id),
                id,
            })
            .collect()
    }

    fn snapshot(&self) -> Vec<(String, SharedExtension, ExtensionContext)> {
        self.loaded
            .read()
            .iter()
            .map(|e| (e.id.clone(), e.instance.clone(), e.context.clone()))
            .collect()
    }

    fn refresh_config(&self) {
        match VaultConfig::load(&self.services.vault_path) {
            Ok(fresh) => *self.config.write() = fresh,
            Err(e) => log::warn!("Keeping previous vault config, reload failed: {}", e),
        }
    }

    fn instantiate_and_register(&self, id: &str) -> Result<LoadedExtension> {
        let factory = self
            .catalog
            .factory(id)
            .ok_or_else(|| KernelError::ExtensionNotFound(id.to_string()))?;
        let settings = self.config.read().settings_for(id);
        let context = ExtensionContext::new(id, settings, self.services.clone());

        let registered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let instance = factory(&context)?;
            instance.register_commands(&context)?;
            Ok::<_, anyhow::Error>(instance)
        }));

        let failure = match registered {
            Ok(Ok(instance)) => {
                log::debug!("[plugin:{}] commands registered", id);
                return Ok(LoadedExtension {
                    id: id.to_string(),
                    instance,
                    context,
                });
            }
            Ok(Err(e)) => e,
            Err(panic) => anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref())),
        };

        let removed = self.services.registry.remove_owner(id);
        if !removed.is_empty() {
            log::debug!("[plugin:{}] rolled back commands {:?}", id, removed);
        }
        Err(KernelError::Extension {
            id: id.to_string(),
            cause: failure,
        })
    }

    async fn activate(&self, entry: LoadedExtension) -> Result<()> {
        if let Err(cause) = guarded(entry.instance.on_load(&entry.context)).await {
            self.teardown(&entry.id);
            return Err(KernelError::Extension {
                id: entry.id,
                cause,
            });
        }

        let instance = entry.instance.clone();
        let context = entry.context.downgrade();
        entry.context.subscribe(
            topics::SYSTEM_TICK,
            0,
            event_handler(move |_| {
                let instance = instance.clone();
                let context = context.upgrade();
                async move {
                    match context {
                        Some(context) => instance.on_tick(&context).await,
                        None => Ok(()),
                    }
                }
            }),
        );

        log::info!("[plugin:{}] loaded", entry.id);
        self.loaded.write().push(entry);
        Ok(())
    }

    async fn unload_locked(&self, id: &str) -> Result<()> {
        let entry = {
            let mut loaded = self.loaded.write();
            let position = loaded
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| KernelError::ExtensionNotFound(id.to_string()))?;
            loaded.remove(position)
        };

        if let Err(e) = guarded(entry.instance.on_unload(&entry.context)).await {
            log::error!("[plugin:{}] on_unload failed: {}", id, e);
        }
        self.teardown(id);
        log::info!("[plugin:{}] unloaded", id);
        Ok(())
    }

    fn teardown(&self, id: &str) {
        let commands = self.services.registry.remove_owner(id);
        let subscriptions = self.services.bus.remove_owner(id);
        log::debug!(
            "[plugin:{}] removed {} command(s), {} subscription(s)",
            id,
            commands.len(),
            subscriptions
        );
    }

    async fn announce(&self, topic: &str, id: &str) {
        self.services
            .bus
            .publish(topic, json!({ "plugin_id": id }), PublishMode::Concurrent)
            .await;
    }
}

async fn guarded<F>(future: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}
