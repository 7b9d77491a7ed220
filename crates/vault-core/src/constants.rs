use serde::{Deserialize, Serialize};

pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of server-initiated pushes.
pub const TRIGGER_EVENT_METHOD: &str = "trigger_event";

pub const VAULT_CONFIG_FILE: &str = ".vault.toml";
pub const MEMORY_DIR: &str = ".memory";

/// Owner tag of the commands the kernel registers itself.
pub const CORE_OWNER: &str = "core";

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 5;

/// Internal pub/sub topic names.
pub mod topics {
    pub const PIPELINE_OUTPUT: &str = "pipeline:output";
    pub const SYSTEM_TICK: &str = "system:tick";
    pub const SYSTEM_READY: &str = "system:ready";
    pub const SYSTEM_SHUTDOWN: &str = "system:shutdown";
    pub const PLUGIN_LOADED: &str = "plugin:loaded";
    pub const PLUGIN_UNLOADED: &str = "plugin:unloaded";
}

/// Kind of event pushed to the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Notify,
    UpdateState,
    UiCommand,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Notify => "NOTIFY",
            EventType::UpdateState => "UPDATE_STATE",
            EventType::UiCommand => "UI_COMMAND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventScope {
    #[default]
    Window,
    Vault,
    Global,
}

impl EventScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventScope::Window => "window",
            EventScope::Vault => "vault",
            EventScope::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::Notify.as_str(), "NOTIFY");
        assert_eq!(EventType::UpdateState.as_str(), "UPDATE_STATE");
        assert_eq!(
            serde_json::to_value(EventType::UiCommand).unwrap(),
            serde_json::json!("UI_COMMAND")
        );
    }

    #[test]
    fn only_emitted_event_types_parse() {
        for name in ["NOTIFY", "UPDATE_STATE", "UI_COMMAND"] {
            assert!(serde_json::from_value::<EventType>(serde_json::json!(name)).is_ok());
        }
        for name in ["PROGRESS", "LLM_RESPONSE"] {
            assert!(serde_json::from_value::<EventType>(serde_json::json!(name)).is_err());
        }
    }

    #[test]
    fn scope_and_severity_serialize_lowercase() {
        assert_eq!(serde_json::to_value(EventScope::Vault).unwrap(), "vault");
        assert_eq!(serde_json::to_value(Severity::Warning).unwrap(), "warning");
        assert_eq!(EventScope::default(), EventScope::Window);
    }
}
