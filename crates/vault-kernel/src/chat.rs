use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use vault_core::ids::short_id;
use vault_core::{topics, Message, TurnRecord};

use crate::bus::{EventBus, PublishMode};

/// Produces the assistant reply for one user turn.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, chat_id: &str, message: &str) -> anyhow::Result<String>;
}

/// Replies with the user's own message.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoClient;

#[async_trait]
impl ChatClient for EchoClient {
    async fn complete(&self, _chat_id: &str, message: &str) -> anyhow::Result<String> {
        Ok(format!("Echo: {}", message))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default = "default_save")]
    pub save_to_memory: bool,
}

fn default_save() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageIds {
    pub user_message_id: String,
    pub assistant_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub status: String,
    pub chat_id: String,
    pub response: String,
    pub message_ids: MessageIds,
}

pub fn new_chat_id() -> String {
    format!("chat_{}_{}", Utc::now().timestamp(), &short_id()[..6])
}

/// Runs one chat turn and announces it on the pipeline output topic.
#[derive(Clone)]
pub struct ChatPipeline {
    client: Arc<dyn ChatClient>,
    bus: Arc<EventBus>,
}

impl ChatPipeline {
    pub fn new(client: Arc<dyn ChatClient>, bus: Arc<EventBus>) -> Self {
        Self { client, bus }
    }

    pub async fn send(&self, request: ChatRequest) -> anyhow::Result<ChatReply> {
        let message = request.message.trim();
        if message.is_empty() {
            anyhow::bail!("message is required");
        }
        let chat_id = request
            .chat_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_chat_id);

        let response = self.client.complete(&chat_id, message).await?;

        let turn = TurnRecord {
            chat_id: chat_id.clone(),
            user_message: Message::user(message),
            assistant_message: Message::assistant(response.clone()),
            save_to_memory: request.save_to_memory,
        };
        let message_ids = MessageIds {
            user_message_id: turn.user_message.id.clone(),
            assistant_message_id: turn.assistant_message.id.clone(),
        };

        let report = self
            .bus
            .publish(
                topics::PIPELINE_OUTPUT,
                serde_json::to_value(&turn)?,
                PublishMode::Sequential,
            )
            .await;
        if report.failed > 0 {
            log::warn!(
                "{} output subscriber(s) failed for chat '{}'",
                report.failed,
                chat_id
            );
        }

        Ok(ChatReply {
            status: "success".to_string(),
            chat_id,
            response,
            message_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event_handler;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn send_publishes_turn_and_returns_ids() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            topics::PIPELINE_OUTPUT,
            "test",
            0,
            event_handler(move |payload| {
                let sink = sink.clone();
                async move {
                    let turn: TurnRecord = serde_json::from_value((*payload).clone())?;
                    sink.lock().push(turn);
                    Ok(())
                }
            }),
        );

        let pipeline = ChatPipeline::new(Arc::new(EchoClient), bus);
        let reply = pipeline
            .send(ChatRequest {
                message: "hello".into(),
                chat_id: None,
                save_to_memory: true,
            })
            .await
            .unwrap();

        assert!(reply.chat_id.starts_with("chat_"));
        assert_eq!(reply.response, "Echo: hello");

        let turns = seen.lock();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].chat_id, reply.chat_id);
        assert_eq!(turns[0].user_message.id, reply.message_ids.user_message_id);
        assert_eq!(
            turns[0].assistant_message.id,
            reply.message_ids.assistant_message_id
        );
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let pipeline = ChatPipeline::new(Arc::new(EchoClient), Arc::new(EventBus::new()));
        let result = pipeline
            .send(ChatRequest {
                message: "   ".into(),
                chat_id: Some("c".into()),
                save_to_memory: true,
            })
            .await;
        assert!(result.is_err());
    }
}
