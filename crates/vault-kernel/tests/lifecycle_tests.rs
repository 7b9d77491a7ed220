use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use vault_kernel::{
    command_handler, event_handler, Extension, ExtensionCatalog, ExtensionContext, Kernel,
    KernelError, KernelOptions, PublishMode, SharedExtension, VaultConfig,
};

#[derive(Default)]
struct Counters {
    pings: AtomicUsize,
    ticks: AtomicUsize,
    connects: AtomicUsize,
    unloads: AtomicUsize,
    builds: AtomicUsize,
}

struct PingExtension {
    counters: Arc<Counters>,
}

#[async_trait]
impl Extension for PingExtension {
    fn id(&self) -> &str {
        "ping"
    }

    fn register_commands(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let counters = self.counters.clone();
        let greeting: String = ctx.setting("greeting").unwrap_or_else(|| "pong".into());
        ctx.register_command(
            "ping.count",
            command_handler(move |_| {
                let counters = counters.clone();
                let greeting = greeting.clone();
                async move {
                    Ok(json!({
                        "greeting": greeting,
                        "pings": counters.pings.load(Ordering::SeqCst)
                    }))
                }
            }),
        )?;
        Ok(())
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let counters = self.counters.clone();
        ctx.subscribe(
            "test:ping",
            0,
            event_handler(move |_| {
                let counters = counters.clone();
                async move {
                    counters.pings.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        Ok(())
    }

    async fn on_unload(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        self.counters.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_client_connected(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_tick(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        self.counters.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registers one command, then fails.
struct BrokenRegistration;

#[async_trait]
impl Extension for BrokenRegistration {
    fn id(&self) -> &str {
        "broken_registration"
    }

    fn register_commands(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        ctx.register_command(
            "broken.partial",
            command_handler(|_| async { Ok(Value::Null) }),
        )?;
        anyhow::bail!("registration exploded")
    }
}

/// Registers fine but fails to activate.
struct BrokenActivation;

#[async_trait]
impl Extension for BrokenActivation {
    fn id(&self) -> &str {
        "broken_activation"
    }

    fn register_commands(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        ctx.register_command(
            "activation.cmd",
            command_handler(|_| async { Ok(Value::Null) }),
        )?;
        Ok(())
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        ctx.subscribe("test:ping", 5, event_handler(|_| async { Ok(()) }));
        anyhow::bail!("activation exploded")
    }
}

/// Calls a command of an extension registered after it, during activation.
struct Caller {
    seen: Arc<parking_lot::Mutex<Option<Value>>>,
}

#[async_trait]
impl Extension for Caller {
    fn id(&self) -> &str {
        "caller"
    }

    fn register_commands(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let result = ctx.execute("ping.count", json!({})).await?;
        *self.seen.lock() = Some(result);
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    kernel: Arc<Kernel>,
    counters: Arc<Counters>,
    seen: Arc<parking_lot::Mutex<Option<Value>>>,
}

async fn boot(config: Option<&str>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    if let Some(config) = config {
        std::fs::write(dir.path().join(".vault.toml"), config).unwrap();
    }

    let counters = Arc::new(Counters::default());
    let seen = Arc::new(parking_lot::Mutex::new(None));

    let ping_counters = counters.clone();
    let caller_seen = seen.clone();
    let catalog = ExtensionCatalog::new()
        .with("caller", move |_| {
            Ok(Arc::new(Caller {
                seen: caller_seen.clone(),
            }) as SharedExtension)
        })
        .with("broken_registration", |_| {
            Ok(Arc::new(BrokenRegistration) as SharedExtension)
        })
        .with("broken_activation", |_| {
            Ok(Arc::new(BrokenActivation) as SharedExtension)
        })
        .with("ping", move |_| {
            ping_counters.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(PingExtension {
                counters: ping_counters.clone(),
            }) as SharedExtension)
        });

    let kernel = Kernel::new(KernelOptions::new(dir.path()).with_catalog(catalog)).unwrap();
    kernel.initialize().await.unwrap();

    Fixture {
        _dir: dir,
        kernel,
        counters,
        seen,
    }
}

#[tokio::test]
async fn failing_extensions_are_skipped_and_rolled_back() {
    let fx = boot(None).await;
    let loaded = fx.kernel.extensions().loaded_ids();

    assert_eq!(loaded, vec!["caller", "ping"]);
    assert!(!fx.kernel.registry().contains("broken.partial"));
    assert!(!fx.kernel.registry().contains("activation.cmd"));
    assert_eq!(fx.kernel.bus().owner_subscription_count("broken_activation"), 0);
}

#[tokio::test]
async fn activation_sees_every_registered_command() {
    let fx = boot(None).await;
    let seen = fx.seen.lock().clone().unwrap();
    assert_eq!(seen["greeting"], "pong");
}

#[tokio::test]
async fn unload_removes_commands_and_subscriptions() {
    let fx = boot(None).await;
    let bus = fx.kernel.bus().clone();

    bus.publish("test:ping", json!({}), PublishMode::Sequential)
        .await;
    assert_eq!(fx.counters.pings.load(Ordering::SeqCst), 1);

    fx.kernel.extensions().unload("ping").await.unwrap();

    assert!(!fx.kernel.registry().contains("ping.count"));
    assert_eq!(bus.owner_subscription_count("ping"), 0);
    assert_eq!(fx.counters.unloads.load(Ordering::SeqCst), 1);

    bus.publish("test:ping", json!({}), PublishMode::Sequential)
        .await;
    assert_eq!(fx.counters.pings.load(Ordering::SeqCst), 1);

    assert!(matches!(
        fx.kernel.extensions().unload("ping").await,
        Err(KernelError::ExtensionNotFound(_))
    ));
}

#[tokio::test]
async fn reload_rebuilds_with_fresh_settings() {
    let fx = boot(None).await;
    assert_eq!(fx.counters.builds.load(Ordering::SeqCst), 1);

    std::fs::write(
        fx.kernel.vault_path().join(".vault.toml"),
        "[extensions.ping]\ngreeting = \"hello again\"\n",
    )
    .unwrap();

    fx.kernel.extensions().reload("ping").await.unwrap();
    assert_eq!(fx.counters.builds.load(Ordering::SeqCst), 2);
    assert_eq!(fx.counters.unloads.load(Ordering::SeqCst), 1);

    let result = fx.kernel.execute("ping.count", json!({})).await.unwrap();
    assert_eq!(result["greeting"], "hello again");
    assert_eq!(fx.kernel.bus().subscriber_count("test:ping"), 1);

    assert!(matches!(
        fx.kernel.extensions().reload("not_in_catalog").await,
        Err(KernelError::ExtensionNotFound(_))
    ));
}

#[tokio::test]
async fn disabled_extension_is_not_loaded_until_reload() {
    let fx = boot(Some("[extensions.ping]\nenabled = false\n")).await;
    assert!(!fx.kernel.extensions().is_loaded("ping"));

    fx.kernel.extensions().reload("ping").await.unwrap();
    assert!(fx.kernel.extensions().is_loaded("ping"));
}

#[tokio::test]
async fn toggle_persists_flag_without_loading() {
    let fx = boot(None).await;
    fx.kernel.extensions().toggle("ping", false).await.unwrap();

    assert!(fx.kernel.extensions().is_loaded("ping"));
    let on_disk = VaultConfig::load(fx.kernel.vault_path()).unwrap();
    assert!(!on_disk.is_enabled("ping"));

    assert!(matches!(
        fx.kernel.extensions().toggle("unknown", true).await,
        Err(KernelError::ExtensionNotFound(_))
    ));
}

#[tokio::test]
async fn tick_and_client_connected_reach_loaded_extensions() {
    let fx = boot(None).await;
    fx.kernel.extensions().tick().await;
    fx.kernel.extensions().tick().await;
    fx.kernel.extensions().client_connected().await;

    assert_eq!(fx.counters.ticks.load(Ordering::SeqCst), 2);
    assert_eq!(fx.counters.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lifecycle_commands_report_in_band() {
    let fx = boot(None).await;

    let ok = fx
        .kernel
        .execute("plugins.unload", json!({"plugin_id": "ping"}))
        .await
        .unwrap();
    assert_eq!(ok["status"], "success");

    let missing = fx
        .kernel
        .execute("plugins.unload", json!({"plugin_id": "ping"}))
        .await
        .unwrap();
    assert_eq!(missing["status"], "error");

    let reloaded = fx
        .kernel
        .execute("plugins.reload", json!({"plugin_id": "ping"}))
        .await
        .unwrap();
    assert_eq!(reloaded["status"], "success");

    let listed = fx.kernel.execute("plugins.list", json!({})).await.unwrap();
    let plugins = listed["plugins"].as_array().unwrap();
    assert_eq!(plugins.len(), 4);
}

#[tokio::test]
async fn invalid_vault_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let err = Kernel::new(KernelOptions::new(&missing)).err().unwrap();
    assert!(err.is_fatal());

    std::fs::write(dir.path().join(".vault.toml"), "[broken").unwrap();
    let err = Kernel::new(KernelOptions::new(dir.path())).err().unwrap();
    assert!(matches!(err, KernelError::Config(_)));
}

#[tokio::test]
async fn memory_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let _kernel = Kernel::new(KernelOptions::new(dir.path())).unwrap();
    assert!(dir.path().join(".memory").is_dir());
}

#[tokio::test]
async fn dropping_the_kernel_frees_bus_and_registry() {
    let fx = boot(None).await;
    let bus = Arc::downgrade(fx.kernel.bus());
    let registry = Arc::downgrade(fx.kernel.registry());

    fx.kernel.extensions().tick().await;
    assert_eq!(fx.counters.ticks.load(Ordering::SeqCst), 1);

    let counters = fx.counters.clone();
    drop(fx);

    assert!(bus.upgrade().is_none());
    assert!(registry.upgrade().is_none());
    assert_eq!(counters.unloads.load(Ordering::SeqCst), 0);
}
