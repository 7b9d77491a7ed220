use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::{KernelError, Result};

pub type CommandFuture = BoxFuture<'static, anyhow::Result<Value>>;
pub type CommandHandler = Arc<dyn Fn(Value) -> CommandFuture + Send + Sync>;

/// Boxes an async closure into a [`CommandHandler`].
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

#[derive(Clone)]
struct CommandEntry {
    handler: CommandHandler,
    owner: String,
}

/// Command id to handler, tagged with the owning extension.
pub struct CommandRegistry {
    commands: DashMap<String, CommandEntry>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        id: &str,
        handler: CommandHandler,
        owner: &str,
        override_existing: bool,
    ) -> Result<()> {
        let id = id.trim();
        if id.is_empty() {
            return Err(KernelError::InvalidCommand(
                "command id cannot be empty".to_string(),
            ));
        }

        let entry = CommandEntry {
            handler,
            owner: owner.to_string(),
        };

        match self.commands.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !override_existing {
                    return Err(KernelError::DuplicateCommand(id.to_string()));
                }
                log::info!(
                    "Command '{}' overridden by '{}' (was '{}')",
                    id,
                    owner,
                    occupied.get().owner
                );
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        log::debug!("Registered command '{}' for '{}'", id, owner);
        Ok(())
    }

    /// Runs the handler for `id`. The map is not borrowed while the handler
    /// runs, so handlers may call back into the registry.
    pub async fn execute(&self, id: &str, args: Value) -> Result<Value> {
        let handler = match self.commands.get(id) {
            Some(entry) => entry.handler.clone(),
            None => {
                return Err(KernelError::CommandNotFound {
                    id: id.to_string(),
                    available: self.ids(),
                })
            }
        };

        let outcome = AssertUnwindSafe(async move { handler(args).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => {
                log::error!("Command '{}' failed: {:#}", id, cause);
                Err(KernelError::CommandExecution {
                    id: id.to_string(),
                    cause,
                })
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!("Command '{}' panicked: {}", id, message);
                Err(KernelError::CommandExecution {
                    id: id.to_string(),
                    cause: anyhow::anyhow!("handler panicked: {}", message),
                })
            }
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.commands.remove(id).is_some()
    }

    /// Removes every command owned by `owner`, returning the removed ids.
    pub fn remove_owner(&self, owner: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .commands
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| entry.key().clone())
            .collect();

        ids.into_iter()
            .filter(|id| {
                self.commands
                    .remove_if(id, |_, entry| entry.owner == owner)
                    .is_some()
            })
            .collect()
    }

    pub fn owner_of(&self, id: &str) -> Option<String> {
        self.commands.get(id).map(|entry| entry.owner.clone())
    }

    pub fn list(&self) -> BTreeMap<String, String> {
        self.commands
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().owner.clone()))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.commands.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.commands.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: Value) -> CommandHandler {
        command_handler(move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn register_and_execute() {
        let registry = CommandRegistry::new();
        registry
            .register(
                "echo",
                command_handler(|args| async move { Ok(args) }),
                "core",
                false,
            )
            .unwrap();

        let result = registry.execute("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn duplicate_without_override_keeps_original() {
        let registry = CommandRegistry::new();
        registry
            .register("dup", constant(json!("first")), "a", false)
            .unwrap();

        let duplicate = registry.register("dup", constant(json!("second")), "b", false);
        assert!(matches!(duplicate, Err(KernelError::DuplicateCommand(id)) if id == "dup"));
        assert_eq!(registry.execute("dup", json!({})).await.unwrap(), "first");
        assert_eq!(registry.owner_of("dup").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn override_replaces_handler_and_owner() {
        let registry = CommandRegistry::new();
        registry
            .register("dup", constant(json!("first")), "a", false)
            .unwrap();
        registry
            .register("dup", constant(json!("second")), "b", true)
            .unwrap();

        assert_eq!(registry.execute("dup", json!({})).await.unwrap(), "second");
        assert_eq!(registry.owner_of("dup").as_deref(), Some("b"));
    }

    #[test]
    fn empty_id_is_rejected() {
        let registry = CommandRegistry::new();
        let result = registry.register("  ", constant(json!(null)), "a", false);
        assert!(matches!(result, Err(KernelError::InvalidCommand(_))));
    }

    #[tokio::test]
    async fn missing_command_lists_available() {
        let registry = CommandRegistry::new();
        registry
            .register("known", constant(json!(1)), "a", false)
            .unwrap();

        match registry.execute("unknown", json!({})).await {
            Err(KernelError::CommandNotFound { id, available }) => {
                assert_eq!(id, "unknown");
                assert_eq!(available, vec!["known".to_string()]);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn handler_error_is_wrapped_with_id() {
        let registry = CommandRegistry::new();
        registry
            .register(
                "boom",
                command_handler(|_| async move { Err(anyhow::anyhow!("kaput")) }),
                "a",
                false,
            )
            .unwrap();

        match registry.execute("boom", json!({})).await {
            Err(KernelError::CommandExecution { id, cause }) => {
                assert_eq!(id, "boom");
                assert_eq!(cause.to_string(), "kaput");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn handler_panic_is_wrapped() {
        let registry = CommandRegistry::new();
        registry
            .register(
                "panics",
                command_handler(|_| async move {
                    if true {
                        panic!("bad handler");
                    }
                    Ok(json!(null))
                }),
                "a",
                false,
            )
            .unwrap();

        let result = registry.execute("panics", json!({})).await;
        assert!(
            matches!(result, Err(KernelError::CommandExecution { cause, .. }) if cause.to_string().contains("bad handler"))
        );
    }

    #[tokio::test]
    async fn remove_owner_drops_only_owned_commands() {
        let registry = CommandRegistry::new();
        registry.register("a.one", constant(json!(1)), "a", false).unwrap();
        registry.register("a.two", constant(json!(2)), "a", false).unwrap();
        registry.register("b.one", constant(json!(3)), "b", false).unwrap();

        let mut removed = registry.remove_owner("a");
        removed.sort();
        assert_eq!(removed, vec!["a.one", "a.two"]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("b.one"));
    }

    #[tokio::test]
    async fn handler_can_reenter_registry() {
        let registry = Arc::new(CommandRegistry::new());
        registry.register("inner", constant(json!("inner")), "a", false).unwrap();

        let weak = Arc::downgrade(&registry);
        registry
            .register(
                "outer",
                command_handler(move |_| {
                    let weak = weak.clone();
                    async move {
                        let registry = weak.upgrade().ok_or_else(|| anyhow::anyhow!("gone"))?;
                        registry.register("late", constant(json!(0)), "a", false)?;
                        Ok(registry.execute("inner", json!({})).await?)
                    }
                }),
                "a",
                false,
            )
            .unwrap();

        assert_eq!(registry.execute("outer", json!({})).await.unwrap(), "inner");
        assert!(registry.contains("late"));
    }
}
