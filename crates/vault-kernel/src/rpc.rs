use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use vault_core::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

use crate::chat::ChatRequest;
use crate::error::KernelError;
use crate::kernel::Kernel;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl From<RpcError> for JsonRpcError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::MethodNotFound(method) => JsonRpcError::method_not_found(&method),
            RpcError::InvalidParams(detail) => JsonRpcError::invalid_params(detail),
            RpcError::Kernel(KernelError::CommandNotFound { id, available }) => {
                JsonRpcError::new(
                    JsonRpcError::METHOD_NOT_FOUND,
                    format!("Command not found: {}", id),
                )
                .with_data(json!({ "command": id, "available": available }))
            }
            RpcError::Kernel(KernelError::CommandExecution { id, cause }) => {
                JsonRpcError::internal(format!("Command '{}' failed: {}", id, cause))
                    .with_data(json!({ "command": id, "cause": format!("{:#}", cause) }))
            }
            RpcError::Kernel(other) => JsonRpcError::internal(other.to_string()),
            RpcError::Internal(cause) => JsonRpcError::internal(format!("{:#}", cause)),
        }
    }
}

/// Turns JSON-RPC envelopes into kernel calls. Every failure below this
/// point comes back as a JSON-RPC error, never as a transport error.
#[derive(Clone)]
pub struct RpcRouter {
    kernel: Arc<Kernel>,
}

impl RpcRouter {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// `None` when the request was a notification.
    pub async fn handle_text(&self, body: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => self.handle_value(value).await,
            Err(e) => Some(JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::parse_error(e.to_string()),
            )),
        }
    }

    pub async fn handle_value(&self, value: Value) -> Option<JsonRpcResponse> {
        let fallback_id = value.get("id").cloned().unwrap_or(Value::Null);
        let request = match JsonRpcRequest::from_value(value) {
            Ok(request) => request,
            Err(error) => return Some(JsonRpcResponse::failure(fallback_id, error)),
        };
        self.handle(request).await
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        log::debug!("RPC {}", request.method);
        let outcome = self.dispatch(&request).await;

        let id = match request.id {
            Some(id) => id,
            None => {
                if let Err(e) = outcome {
                    log::warn!("Notification '{}' failed: {}", request.method, e);
                }
                return None;
            }
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                log::warn!("RPC '{}' failed: {}", request.method, e);
                JsonRpcResponse::failure(id, e.into())
            }
        })
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> Result<Value, RpcError> {
        let params = match &request.params {
            None | Some(Value::Object(_)) => request.params_object(),
            Some(_) => {
                return Err(RpcError::InvalidParams(
                    "params must be an object".to_string(),
                ))
            }
        };

        match request.method.as_str() {
            "execute_command" => {
                let command = params
                    .get("command")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| RpcError::InvalidParams("'command' is required".into()))?;
                let args = match params.get("args") {
                    None | Some(Value::Null) => json!({}),
                    Some(args @ Value::Object(_)) => args.clone(),
                    Some(_) => {
                        return Err(RpcError::InvalidParams("'args' must be an object".into()))
                    }
                };
                Ok(self.kernel.execute(command, args).await?)
            }
            "list_commands" => Ok(json!({ "commands": self.kernel.registry().list() })),
            "get_vault_info" => Ok(self.kernel.vault_info()),
            "chat.send_message" => {
                let request: ChatRequest = serde_json::from_value(params)
                    .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
                if request.message.trim().is_empty() {
                    return Err(RpcError::InvalidParams("'message' is required".into()));
                }
                let reply = self.kernel.chat().send(request).await?;
                Ok(serde_json::to_value(reply).map_err(anyhow::Error::from)?)
            }
            "system.client_ready" => {
                self.kernel.extensions().client_connected().await;
                Ok(json!({ "status": "ok" }))
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }
}
