use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use vault_core::{topics, ConversationDocument, ConversationStore, TurnRecord};
use vault_kernel::{command_handler, event_handler, CommandHandler, Extension, ExtensionContext};

pub const EXTENSION_ID: &str = "memory";

/// Persists a turn before anything else reads it.
pub const PERSIST_PRIORITY: i32 = 100;

#[derive(Debug, Deserialize)]
struct ChatArgs {
    #[serde(default)]
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct SaveArgs {
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    data: Value,
}

/// System of record for conversation documents.
pub struct MemoryExtension {
    store: ConversationStore,
}

impl MemoryExtension {
    pub fn new(ctx: &ExtensionContext) -> Self {
        Self {
            store: ctx.store().clone(),
        }
    }

    fn command<A, F, Fut>(&self, f: F) -> CommandHandler
    where
        A: for<'de> Deserialize<'de> + Send + 'static,
        F: Fn(ConversationStore, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let store = self.store.clone();
        let f = Arc::new(f);
        command_handler(move |raw: Value| {
            let store = store.clone();
            let f = f.clone();
            async move {
                let outcome = match serde_json::from_value::<A>(raw) {
                    Ok(args) => f(store, args).await,
                    Err(e) => Err(anyhow::anyhow!("invalid arguments: {}", e)),
                };
                Ok(in_band(outcome))
            }
        })
    }
}

#[async_trait]
impl Extension for MemoryExtension {
    fn id(&self) -> &str {
        EXTENSION_ID
    }

    fn register_commands(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        ctx.register_command(
            "chat.load",
            self.command(|store, args: ChatArgs| async move {
                let chat_id = required(&args.chat_id)?;
                let document = store.load_or_default(chat_id).await?;
                Ok(json!({ "chat_id": chat_id, "data": document }))
            }),
        )?;

        ctx.register_command(
            "chat.save",
            self.command(|store, args: SaveArgs| async move {
                let chat_id = required(&args.chat_id)?;
                let incoming = ConversationDocument::from_value(args.data)?;
                let count = incoming.messages.len();
                store
                    .update_or_create::<_, anyhow::Error, _>(chat_id, move |document| {
                        *document = incoming;
                        Ok(())
                    })
                    .await?;
                log::debug!("[plugin:{}] saved '{}' ({} messages)", EXTENSION_ID, chat_id, count);
                Ok(json!({ "chat_id": chat_id, "messages": count }))
            }),
        )?;

        ctx.register_command(
            "chat.list",
            self.command(|store, _: Value| async move {
                Ok(json!({ "chats": store.list().await? }))
            }),
        )?;

        ctx.register_command(
            "chat.delete",
            self.command(|store, args: ChatArgs| async move {
                let chat_id = required(&args.chat_id)?;
                let deleted = store.delete(chat_id).await?;
                Ok(json!({ "chat_id": chat_id, "deleted": deleted }))
            }),
        )?;

        // A branch-aware accessor may already own it when only memory reloads.
        if let Some(owner) = ctx.registry().owner_of("chat.get_history") {
            log::debug!("[plugin:{}] chat.get_history kept by '{}'", EXTENSION_ID, owner);
            return Ok(());
        }
        ctx.register_command(
            "chat.get_history",
            self.command(|store, args: ChatArgs| async move {
                let chat_id = required(&args.chat_id)?;
                let document = store.load_or_default(chat_id).await?;
                let history = serde_json::to_value(&document.messages)?;
                Ok(json!({ "chat_id": chat_id, "history": history, "active_branch": null }))
            }),
        )?;
        Ok(())
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let store = self.store.clone();
        ctx.subscribe(
            topics::PIPELINE_OUTPUT,
            PERSIST_PRIORITY,
            event_handler(move |payload| {
                let store = store.clone();
                async move {
                    let turn: TurnRecord = serde_json::from_value((*payload).clone())?;
                    if !turn.save_to_memory {
                        log::debug!("[plugin:{}] '{}' opted out of memory", EXTENSION_ID, turn.chat_id);
                        return Ok(());
                    }
                    append_turn(&store, turn).await
                }
            }),
        );
        Ok(())
    }
}

async fn append_turn(store: &ConversationStore, turn: TurnRecord) -> anyhow::Result<()> {
    let TurnRecord {
        chat_id,
        user_message,
        assistant_message,
        ..
    } = turn;

    let total = store
        .update_or_create::<_, anyhow::Error, _>(&chat_id, move |document| {
            document.push_message(user_message);
            document.push_message(assistant_message);
            Ok(document.messages.len())
        })
        .await?;
    log::debug!("[plugin:{}] '{}' now holds {} messages", EXTENSION_ID, chat_id, total);
    Ok(())
}

fn required(chat_id: &str) -> anyhow::Result<&str> {
    if chat_id.trim().is_empty() {
        anyhow::bail!("chat_id required");
    }
    Ok(chat_id)
}

/// `{status: "success", ...body}` or `{status: "error", error}`.
pub(crate) fn in_band(outcome: anyhow::Result<Value>) -> Value {
    match outcome {
        Ok(mut body) => {
            if let Value::Object(map) = &mut body {
                map.insert("status".to_string(), json!("success"));
            }
            body
        }
        Err(e) => {
            log::warn!("[plugin:{}] {:#}", EXTENSION_ID, e);
            json!({ "status": "error", "error": e.to_string() })
        }
    }
}
