use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use vault_core::{topics, TurnRecord};
use vault_kernel::{
    command_handler, event_handler, BackgroundTasks, CommandHandler, Extension,
    ExtensionContext, FrontendEmitter,
};

use crate::engine::{BranchEngine, BranchError};
use crate::naming::{BranchNamer, HeuristicNamer};

pub const EXTENSION_ID: &str = "chat_branches";

/// Runs after `memory` has appended the turn, before `topics` reads it.
pub const ANNOTATION_PRIORITY: i32 = 50;

#[derive(Debug, Deserialize)]
struct CreateArgs {
    #[serde(default)]
    chat_id: String,
    #[serde(default, alias = "parent_message_id")]
    message_id: String,
    #[serde(default)]
    branch_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwitchArgs {
    #[serde(default)]
    chat_id: String,
    #[serde(default, alias = "branch_id")]
    branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatArgs {
    #[serde(default)]
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct DeleteArgs {
    #[serde(default)]
    chat_id: String,
    #[serde(default, alias = "branch")]
    branch_id: String,
}

#[derive(Debug, Deserialize)]
struct RenameArgs {
    #[serde(default)]
    chat_id: String,
    #[serde(default, alias = "branch")]
    branch_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct HistoryArgs {
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    branch: Option<String>,
}

/// Branch-tree conversations as an extension.
pub struct ChatBranchesExtension {
    engine: Arc<BranchEngine>,
    namer: Arc<dyn BranchNamer>,
    auto_name: bool,
}

impl ChatBranchesExtension {
    pub fn new(ctx: &ExtensionContext) -> Self {
        Self::with_namer(ctx, Arc::new(HeuristicNamer))
    }

    pub fn with_namer(ctx: &ExtensionContext, namer: Arc<dyn BranchNamer>) -> Self {
        Self {
            engine: Arc::new(BranchEngine::new(ctx.store().clone())),
            namer,
            auto_name: ctx.setting("auto_name").unwrap_or(true),
        }
    }

    pub fn engine(&self) -> &Arc<BranchEngine> {
        &self.engine
    }

    fn create_handler(&self, tasks: BackgroundTasks, emitter: FrontendEmitter) -> CommandHandler {
        let engine = self.engine.clone();
        let namer = self.namer.clone();
        let auto_name = self.auto_name;

        in_band(move |args: CreateArgs| {
            let engine = engine.clone();
            let namer = namer.clone();
            let tasks = tasks.clone();
            let emitter = emitter.clone();
            async move {
                let outcome = engine
                    .create_branch(
                        &args.chat_id,
                        &args.message_id,
                        args.branch_id.as_deref(),
                        args.name.as_deref(),
                    )
                    .await?;

                if auto_name && outcome.branch.display_name.is_none() {
                    let chat_id = args.chat_id.clone();
                    let branch_id = outcome.branch.id.clone();
                    let history = outcome.history.clone();
                    tasks.spawn(format!("{}:auto_name", EXTENSION_ID), async move {
                        auto_name_branch(engine, namer, emitter, chat_id, branch_id, history).await
                    });
                }

                Ok(json!({
                    "chat_id": args.chat_id,
                    "branch": outcome.branch.id,
                    "display_name": outcome.branch.display_name,
                    "continuation": outcome.continuation,
                    "history": outcome.history,
                }))
            }
        })
    }

    fn history_handler(&self) -> CommandHandler {
        let engine = self.engine.clone();
        in_band(move |args: HistoryArgs| {
            let engine = engine.clone();
            async move {
                let outcome = engine
                    .get_history(&args.chat_id, args.branch.as_deref())
                    .await?;
                Ok(json!({
                    "chat_id": args.chat_id,
                    "history": outcome.history,
                    "active_branch": outcome.active_branch,
                }))
            }
        })
    }
}

#[async_trait]
impl Extension for ChatBranchesExtension {
    fn id(&self) -> &str {
        EXTENSION_ID
    }

    fn register_commands(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        ctx.register_command(
            "branch.create",
            self.create_handler(ctx.tasks().clone(), ctx.emitter().clone()),
        )?;

        let engine = self.engine.clone();
        ctx.register_command(
            "branch.switch",
            in_band(move |args: SwitchArgs| {
                let engine = engine.clone();
                async move {
                    let outcome = engine
                        .switch_branch(&args.chat_id, args.branch.as_deref())
                        .await?;
                    Ok(json!({
                        "chat_id": args.chat_id,
                        "branch": outcome.branch,
                        "history": outcome.history,
                    }))
                }
            }),
        )?;

        let engine = self.engine.clone();
        ctx.register_command(
            "branch.list",
            in_band(move |args: ChatArgs| {
                let engine = engine.clone();
                async move {
                    let listing = engine.list_branches(&args.chat_id).await?;
                    Ok(json!({
                        "chat_id": args.chat_id,
                        "active_branch": listing.active_branch,
                        "branches": listing.branches,
                    }))
                }
            }),
        )?;

        let engine = self.engine.clone();
        ctx.register_command(
            "branch.delete",
            in_band(move |args: DeleteArgs| {
                let engine = engine.clone();
                async move {
                    let outcome = engine.delete_branch(&args.chat_id, &args.branch_id).await?;
                    Ok(json!({
                        "chat_id": args.chat_id,
                        "deleted": outcome.deleted,
                        "removed_messages": outcome.removed_messages,
                        "active_branch": outcome.active_branch,
                    }))
                }
            }),
        )?;

        let engine = self.engine.clone();
        ctx.register_command(
            "branch.rename",
            in_band(move |args: RenameArgs| {
                let engine = engine.clone();
                async move {
                    let branch = engine
                        .rename_branch(&args.chat_id, &args.branch_id, &args.name)
                        .await?;
                    Ok(json!({
                        "chat_id": args.chat_id,
                        "branch": branch.id,
                        "display_name": branch.display_name,
                    }))
                }
            }),
        )?;

        ctx.register_command("branch.get_history", self.history_handler())?;
        Ok(())
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        ctx.override_command("chat.get_history", self.history_handler())?;

        let engine = self.engine.clone();
        ctx.subscribe(
            topics::PIPELINE_OUTPUT,
            ANNOTATION_PRIORITY,
            event_handler(move |payload| {
                let engine = engine.clone();
                async move {
                    let turn: TurnRecord = serde_json::from_value((*payload).clone())?;
                    if !turn.save_to_memory {
                        return Ok(());
                    }
                    engine.annotate_turn(&turn).await?;
                    Ok(())
                }
            }),
        );

        log::info!("[plugin:{}] loaded, auto naming = {}", ctx.id(), self.auto_name);
        Ok(())
    }

    async fn on_client_connected(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        ctx.emitter().ui_command(
            "register_action",
            json!({
                "id": "branch",
                "icon": "git-branch",
                "label": "Branch",
                "position": 50,
                "type": "button",
                "location": "message-actionbar",
                "command": "event:chat:createBranch",
            }),
        );
        Ok(())
    }
}

/// Wraps a typed branch operation into a command that always answers with
/// `{status: "success" | "error", ...}`.
fn in_band<A, F, Fut>(f: F) -> CommandHandler
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BranchError>> + Send + 'static,
{
    let f = Arc::new(f);
    command_handler(move |raw: Value| {
        let f = f.clone();
        async move {
            let outcome = match serde_json::from_value::<A>(raw) {
                Ok(args) => f(args).await,
                Err(e) => return Ok(json!({ "status": "error", "error": format!("invalid arguments: {}", e) })),
            };
            Ok(match outcome {
                Ok(mut body) => {
                    if let Value::Object(map) = &mut body {
                        map.insert("status".to_string(), json!("success"));
                    }
                    body
                }
                Err(e) => {
                    log::warn!("[plugin:{}] {}", EXTENSION_ID, e);
                    json!({ "status": "error", "error": e.to_string() })
                }
            })
        }
    })
}

async fn auto_name_branch(
    engine: Arc<BranchEngine>,
    namer: Arc<dyn BranchNamer>,
    emitter: FrontendEmitter,
    chat_id: String,
    branch_id: String,
    history: Vec<Value>,
) -> anyhow::Result<()> {
    let name = match namer.suggest(&history).await? {
        Some(name) => name,
        None => return Ok(()),
    };

    if engine.name_if_unnamed(&chat_id, &branch_id, &name).await? {
        emitter.update_state(
            "branch_renamed",
            json!({ "chat_id": chat_id, "branch_id": branch_id, "display_name": name }),
        );
        log::debug!("[plugin:{}] named '{}' as '{}'", EXTENSION_ID, branch_id, name);
    }
    Ok(())
}
