use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use vault_kernel::{command_handler, Kernel, KernelOptions, RpcRouter};

async fn router() -> (TempDir, Arc<Kernel>, RpcRouter) {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::new(KernelOptions::new(dir.path())).unwrap();
    kernel.initialize().await.unwrap();

    kernel
        .registry()
        .register(
            "test.fail",
            command_handler(|_| async { Err(anyhow::anyhow!("deliberate")) }),
            "test",
            false,
        )
        .unwrap();

    let router = RpcRouter::new(kernel.clone());
    (dir, kernel, router)
}

async fn call(router: &RpcRouter, body: Value) -> Value {
    let response = router.handle_value(body).await.unwrap();
    serde_json::to_value(response).unwrap()
}

#[tokio::test]
async fn parse_error() {
    let (_dir, _kernel, router) = router().await;
    let response = router.handle_text("{nope").await.unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.code, -32700);
    assert_eq!(response.id, Value::Null);
}

#[tokio::test]
async fn invalid_request() {
    let (_dir, _kernel, router) = router().await;
    let response = call(&router, json!({"jsonrpc": "1.0", "id": 3, "method": "x"})).await;
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(response["id"], 3);
}

#[tokio::test]
async fn unknown_method_and_command() {
    let (_dir, _kernel, router) = router().await;

    let response = call(&router, json!({"jsonrpc": "2.0", "id": 1, "method": "nope"})).await;
    assert_eq!(response["error"]["code"], -32601);

    let response = call(
        &router,
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "execute_command",
            "params": {"command": "missing.cmd", "args": {}}
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32601);
    let available = response["error"]["data"]["available"].as_array().unwrap();
    assert!(available.contains(&json!("system.info")));
}

#[tokio::test]
async fn invalid_params() {
    let (_dir, _kernel, router) = router().await;

    let response = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 1, "method": "execute_command", "params": {}}),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);

    let response = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 2, "method": "chat.send_message", "params": [1]}),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn command_failure_is_internal_error_with_context() {
    let (_dir, _kernel, router) = router().await;
    let response = call(
        &router,
        json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "execute_command",
            "params": {"command": "test.fail"}
        }),
    )
    .await;

    assert_eq!(response["id"], "abc");
    assert_eq!(response["error"]["code"], -32603);
    assert_eq!(response["error"]["data"]["command"], "test.fail");
    assert!(response["error"]["data"]["cause"]
        .as_str()
        .unwrap()
        .contains("deliberate"));
}

#[tokio::test]
async fn baseline_methods() {
    let (dir, _kernel, router) = router().await;

    let info = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 1, "method": "get_vault_info"}),
    )
    .await;
    let expected_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
    assert_eq!(info["result"]["name"], expected_name);

    let listed = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 2, "method": "list_commands"}),
    )
    .await;
    assert_eq!(listed["result"]["commands"]["system.chat"], "core");

    let chat = call(
        &router,
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "chat.send_message",
            "params": {"message": "hi", "chat_id": "rpc_chat"}
        }),
    )
    .await;
    assert_eq!(chat["result"]["chat_id"], "rpc_chat");
    assert_eq!(chat["result"]["response"], "Echo: hi");

    let ready = call(
        &router,
        json!({"jsonrpc": "2.0", "id": 4, "method": "system.client_ready"}),
    )
    .await;
    assert_eq!(ready["result"]["status"], "ok");
}

#[tokio::test]
async fn notifications_get_no_response() {
    let (_dir, _kernel, router) = router().await;
    let response = router
        .handle_value(json!({"jsonrpc": "2.0", "method": "system.client_ready"}))
        .await;
    assert!(response.is_none());

    let response = router
        .handle_value(json!({"jsonrpc": "2.0", "method": "does.not.exist"}))
        .await;
    assert!(response.is_none());
}
