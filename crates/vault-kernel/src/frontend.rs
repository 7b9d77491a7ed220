use serde_json::{json, Value};
use tokio::sync::broadcast;
use vault_core::{EventScope, EventType, JsonRpcNotification, Severity};

const CHANNEL_CAPACITY: usize = 256;

/// Pushes `trigger_event` notifications to every connected client.
#[derive(Debug, Clone)]
pub struct FrontendEmitter {
    sender: broadcast::Sender<JsonRpcNotification>,
}

impl Default for FrontendEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontendEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.sender.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event_type: EventType, data: Value, scope: EventScope) {
        let notification = JsonRpcNotification::trigger_event(event_type, scope, data);
        match self.sender.send(notification) {
            Ok(receivers) => log::debug!(
                "Emitted {} to {} client(s)",
                event_type.as_str(),
                receivers
            ),
            Err(_) => log::debug!("No clients connected, dropped {}", event_type.as_str()),
        }
    }

    pub fn notify(&self, message: &str, severity: Severity) {
        self.emit(
            EventType::Notify,
            json!({ "message": message, "type": severity }),
            EventScope::Window,
        );
    }

    pub fn update_state(&self, key: &str, value: Value) {
        self.emit(
            EventType::UpdateState,
            json!({ "key": key, "value": value }),
            EventScope::Window,
        );
    }

    pub fn ui_command(&self, command: &str, data: Value) {
        self.emit(
            EventType::UiCommand,
            json!({ "command": command, "data": data }),
            EventScope::Window,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_reaches_subscribers() {
        let emitter = FrontendEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.notify("saved", Severity::Success);

        let push = rx.recv().await.unwrap();
        let params = push.params.unwrap();
        assert_eq!(push.method, "trigger_event");
        assert_eq!(params["event_type"], "NOTIFY");
        assert_eq!(params["data"]["message"], "saved");
        assert_eq!(params["data"]["type"], "success");
    }

    #[tokio::test]
    async fn update_state_and_ui_command_shapes() {
        let emitter = FrontendEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.update_state("branch_name", json!("Alt"));
        emitter.ui_command("register_action", json!({"id": "branch"}));

        let state = rx.recv().await.unwrap().params.unwrap();
        assert_eq!(state["event_type"], "UPDATE_STATE");
        assert_eq!(state["data"]["key"], "branch_name");

        let ui = rx.recv().await.unwrap().params.unwrap();
        assert_eq!(ui["event_type"], "UI_COMMAND");
        assert_eq!(ui["data"]["command"], "register_action");
    }

    #[test]
    fn emit_without_clients_is_dropped() {
        let emitter = FrontendEmitter::new();
        assert_eq!(emitter.client_count(), 0);
        emitter.notify("nobody listening", Severity::Info);
    }
}
