use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use vault_core::{topics, ConversationStore, StoreError, TurnRecord};
use vault_kernel::{command_handler, event_handler, Extension, ExtensionContext};

use crate::memory::in_band;

pub const EXTENSION_ID: &str = "topics";

/// Runs after the turn is persisted and tagged.
pub const INDEX_PRIORITY: i32 = 10;

pub const DEFAULT_MAX_KEYWORDS: usize = 5;

const MIN_WORD_LEN: usize = 3;

const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "all", "also", "and", "any", "are", "because", "been", "before",
    "being", "between", "both", "but", "can", "could", "did", "does", "doing", "down", "each",
    "for", "from", "further", "had", "has", "have", "having", "her", "here", "hers", "him",
    "his", "how", "into", "its", "just", "like", "more", "most", "not", "now", "off", "once",
    "only", "other", "our", "out", "over", "own", "same", "she", "should", "some", "such",
    "than", "that", "the", "their", "them", "then", "there", "these", "they", "this", "those",
    "through", "too", "under", "until", "very", "was", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours",
];

/// Up to `limit` keywords of `text`, most frequent first, ties broken by
/// first appearance.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let words = text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !STOP_WORDS.contains(&w.as_str()));

    for (position, word) in words.enumerate() {
        counts.entry(word).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(limit).map(|(word, _)| word).collect()
}

/// Indexes the keywords of every persisted user message in the background.
pub struct TopicsExtension {
    store: ConversationStore,
    max_keywords: usize,
}

impl TopicsExtension {
    pub fn new(ctx: &ExtensionContext) -> Self {
        Self {
            store: ctx.store().clone(),
            max_keywords: ctx.setting("max_keywords").unwrap_or(DEFAULT_MAX_KEYWORDS),
        }
    }
}

#[async_trait]
impl Extension for TopicsExtension {
    fn id(&self) -> &str {
        EXTENSION_ID
    }

    fn register_commands(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let store = self.store.clone();
        ctx.register_command(
            "topics.list",
            command_handler(move |args| {
                let store = store.clone();
                async move {
                    let chat_id = args
                        .get("chat_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Ok(in_band(list_topics(&store, &chat_id).await))
                }
            }),
        )?;
        Ok(())
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let store = self.store.clone();
        let tasks = ctx.tasks().clone();
        let limit = self.max_keywords;

        ctx.subscribe(
            topics::PIPELINE_OUTPUT,
            INDEX_PRIORITY,
            event_handler(move |payload| {
                let store = store.clone();
                let tasks = tasks.clone();
                async move {
                    let turn: TurnRecord = serde_json::from_value((*payload).clone())?;
                    if !turn.save_to_memory {
                        return Ok(());
                    }
                    tasks.spawn(format!("{}:index", EXTENSION_ID), async move {
                        index_turn(&store, &turn, limit).await
                    });
                    Ok(())
                }
            }),
        );
        Ok(())
    }
}

async fn list_topics(store: &ConversationStore, chat_id: &str) -> anyhow::Result<Value> {
    if chat_id.trim().is_empty() {
        anyhow::bail!("chat_id required");
    }
    let document = store.load_or_default(chat_id).await?;
    Ok(json!({ "chat_id": chat_id, "topics": document.topics }))
}

async fn index_turn(store: &ConversationStore, turn: &TurnRecord, limit: usize) -> anyhow::Result<()> {
    let keywords = extract_keywords(&turn.user_message.content, limit);
    if keywords.is_empty() {
        return Ok(());
    }

    let message_id = turn.user_message.id.clone();
    let indexed = store
        .update::<_, StoreError, _>(&turn.chat_id, |document| {
            let branch = document.message(&message_id).and_then(|m| m.branch.clone());
            document.topics.push(json!({
                "message_id": message_id,
                "branch": branch,
                "keywords": keywords,
                "created_at": Utc::now().to_rfc3339(),
            }));
            Ok(())
        })
        .await;

    match indexed {
        Ok(()) => {
            log::debug!("[plugin:{}] indexed '{}'", EXTENSION_ID, turn.chat_id);
            Ok(())
        }
        // Deleted before the task ran.
        Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_core::{ConversationDocument, Message};

    #[test]
    fn ranks_by_frequency_then_position() {
        let keywords = extract_keywords(
            "Rust borrow checker: why does the borrow checker reject this Rust closure? Rust!",
            5,
        );
        assert_eq!(keywords, vec!["rust", "borrow", "checker", "reject", "closure"]);
    }

    #[test]
    fn drops_stop_words_short_words_and_numbers() {
        assert!(extract_keywords("is it the? 2024 ok", 5).is_empty());
        assert_eq!(extract_keywords("Tokio tokio TOKIO runtime", 1), vec!["tokio"]);
    }

    #[tokio::test]
    async fn index_records_branch_of_user_message() {
        let store = ConversationStore::in_memory();
        let user = Message::user("explain async runtimes").with_branch("alt");
        let assistant = Message::assistant("sure").with_branch("alt");
        let mut document = ConversationDocument::new();
        document.push_message(user.clone());
        document.push_message(assistant.clone());
        store.save("c", &document).await.unwrap();

        let turn = TurnRecord {
            chat_id: "c".into(),
            user_message: user.clone(),
            assistant_message: assistant,
            save_to_memory: true,
        };
        index_turn(&store, &turn, 5).await.unwrap();

        let document = store.load("c").await.unwrap().unwrap();
        assert_eq!(document.topics.len(), 1);
        assert_eq!(document.topics[0]["message_id"], json!(user.id));
        assert_eq!(document.topics[0]["branch"], "alt");
        assert_eq!(
            document.topics[0]["keywords"],
            json!(["explain", "async", "runtimes"])
        );
    }

    #[tokio::test]
    async fn index_of_deleted_chat_is_a_no_op() {
        let store = ConversationStore::in_memory();
        let turn = TurnRecord {
            chat_id: "gone".into(),
            user_message: Message::user("vanished conversation"),
            assistant_message: Message::assistant("..."),
            save_to_memory: true,
        };
        index_turn(&store, &turn, 5).await.unwrap();
        assert!(store.load("gone").await.unwrap().is_none());
    }
}
