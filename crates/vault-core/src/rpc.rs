use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::{EventScope, EventType, JSONRPC_VERSION, TRIGGER_EVENT_METHOD};

// JSON-RPC 2.0 base types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// A request without an id expects no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Params as an object, `{}` when absent.
    pub fn params_object(&self) -> Value {
        match &self.params {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => json!({}),
        }
    }

    /// Checks the envelope of an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, JsonRpcError> {
        let object = value
            .as_object()
            .ok_or_else(|| JsonRpcError::invalid_request("request must be an object"))?;

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(JsonRpcError::invalid_request("jsonrpc must be \"2.0\""));
        }
        if !matches!(object.get("method"), Some(Value::String(_))) {
            return Err(JsonRpcError::invalid_request("method must be a string"));
        }
        match object.get("params") {
            None | Some(Value::Object(_)) | Some(Value::Array(_)) => {}
            Some(_) => {
                return Err(JsonRpcError::invalid_request(
                    "params must be an object or array",
                ))
            }
        }
        match object.get("id") {
            None | Some(Value::String(_)) | Some(Value::Number(_)) | Some(Value::Null) => {}
            Some(_) => return Err(JsonRpcError::invalid_request("id must be a string or number")),
        }

        serde_json::from_value(value).map_err(|e| JsonRpcError::invalid_request(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, format!("Parse error: {}", detail.into()))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(
            Self::INVALID_REQUEST,
            format!("Invalid request: {}", detail.into()),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(
            Self::INVALID_PARAMS,
            format!("Invalid params: {}", detail.into()),
        )
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, detail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Server push carrying `{event_type, scope, data, timestamp}`.
    pub fn trigger_event(event_type: EventType, scope: EventScope, data: Value) -> Self {
        Self::new(
            TRIGGER_EVENT_METHOD,
            Some(json!({
                "event_type": event_type,
                "scope": scope,
                "data": data,
                "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
            })),
        )
    }
}
