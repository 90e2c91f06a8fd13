//! End-to-end tests: an in-memory MCP client and fake proxies over TCP.

mod helpers;

use std::time::Duration;

use helpers::{FakeProxy, RECV_TIMEOUT, TestHub, test_config};
use mcphub::Hub;
use mcphub_core::config::TransportKind;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const INTERNAL_ERROR: i64 = -32603;
const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;
const PARSE_ERROR: i64 = -32700;

#[tokio::test]
async fn test_initialize_reports_hub_identity() {
    let mut hub = TestHub::start().await;
    let response = hub.initialize().await;

    let result = &response["result"];
    assert_eq!(result["serverInfo"]["name"], "test-hub");
    assert_eq!(result["protocolVersion"], "2025-06-18");
    assert_eq!(result["capabilities"]["tools"]["listChanged"], true);

    let pong = hub.client.call("ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_builtin_tool_listed_without_proxies() {
    let mut hub = TestHub::initialized().await;
    assert_eq!(hub.tool_names().await, vec!["hub_proxies"]);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_proxy_tools_become_visible_and_client_is_notified() {
    let mut hub = TestHub::initialized().await;
    let _proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file", "write_file"]).await;

    hub.client
        .notification("notifications/tools/list_changed")
        .await;
    assert_eq!(
        hub.tool_names().await,
        vec!["hub_proxies", "read_file", "write_file"]
    );
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_tools_hidden_until_tools_register() {
    let mut hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::connect(hub.mux_addr, "files").await;
    let registered = proxy.register().await;
    assert_eq!(registered["result"]["sessionId"], "s-001");
    assert_eq!(registered["result"]["proxyId"], "files");

    assert_eq!(hub.tool_names().await, vec!["hub_proxies"]);
    proxy.register_tools(&["read_file"]).await;
    assert_eq!(hub.tool_names().await, vec!["hub_proxies", "read_file"]);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_forwarded_call_is_remapped_both_ways() {
    let mut hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;

    hub.client
        .send(json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "tools/call",
            "params": {"name": "read_file", "arguments": {"path": "/etc/hosts"}}
        }))
        .await;

    let forwarded = proxy.next_call().await;
    assert_eq!(forwarded["id"], 0, "first hub request on the session");
    assert_eq!(forwarded["params"]["name"], "read_file");
    assert_eq!(forwarded["params"]["arguments"]["path"], "/etc/hosts");

    let result = json!({"content": [{"type": "text", "text": "127.0.0.1 localhost"}]});
    proxy.reply(&forwarded["id"], result.clone()).await;

    let response = hub.client.response_to(&json!("abc")).await;
    assert_eq!(response["result"], result);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_proxy_error_is_relayed_to_client() {
    let mut hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;

    hub.client
        .send(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": {"name": "read_file"}
        }))
        .await;
    let forwarded = proxy.next_call().await;
    proxy.reply_error(&forwarded["id"], -32000, "no such file").await;

    let response = hub.client.response_to(&json!(7)).await;
    assert_eq!(response["error"]["code"], -32000);
    assert_eq!(response["error"]["message"], "no such file");
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_replies_reach_the_right_caller() {
    let mut hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;

    for id in [100, 200] {
        hub.client
            .send(json!({
                "jsonrpc": "2.0", "id": id, "method": "tools/call",
                "params": {"name": "read_file", "arguments": {"n": id}}
            }))
            .await;
    }
    let first = proxy.next_call().await;
    let second = proxy.next_call().await;

    proxy.reply(&second["id"], json!({"content": [], "n": second["params"]["arguments"]["n"]})).await;
    proxy.reply(&first["id"], json!({"content": [], "n": first["params"]["arguments"]["n"]})).await;

    for id in [100, 200] {
        let response = hub.client.response_to(&json!(id)).await;
        assert_eq!(response["result"]["n"], id);
    }
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_calls_route_to_the_owning_proxy() {
    let mut hub = TestHub::initialized().await;
    let mut files = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;
    let mut git = FakeProxy::online(hub.mux_addr, "git", &["git_log"]).await;

    hub.client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "git_log"}}))
        .await;
    let forwarded = git.next_call().await;
    git.reply(&forwarded["id"], json!({"content": [{"type": "text", "text": "abc123"}]}))
        .await;
    let response = hub.client.response_to(&json!(1)).await;
    assert_eq!(response["result"]["content"][0]["text"], "abc123");

    hub.client
        .send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "read_file"}}))
        .await;
    let forwarded = files.next_call().await;
    assert_eq!(forwarded["id"], 0);
    files.reply(&forwarded["id"], json!({"content": []})).await;
    let response = hub.client.response_to(&json!(2)).await;
    assert_eq!(response["result"], json!({"content": []}));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_proxy_disconnect_fails_in_flight_call_and_drops_tools() {
    let mut hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;

    hub.client
        .send(json!({
            "jsonrpc": "2.0", "id": "pending", "method": "tools/call",
            "params": {"name": "read_file"}
        }))
        .await;
    proxy.next_call().await;
    drop(proxy);

    let response = hub.client.response_to(&json!("pending")).await;
    assert_eq!(response["error"]["code"], INTERNAL_ERROR);

    let names = hub
        .wait_for_tools(|names| !names.iter().any(|n| n == "read_file"))
        .await;
    assert_eq!(names, vec!["hub_proxies"]);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_tool_name_rejected_for_second_proxy() {
    let mut hub = TestHub::initialized().await;
    let _first = FakeProxy::online(hub.mux_addr, "a", &["shared"]).await;

    let mut second = FakeProxy::connect(hub.mux_addr, "b").await;
    second.register().await;
    let response = second.register_tools(&["shared", "only_b"]).await;
    assert_eq!(response["error"]["code"], INVALID_PARAMS);
    assert_eq!(response["error"]["data"]["rejected"][0]["name"], "shared");
    assert_eq!(response["error"]["data"]["registered"], json!(["only_b"]));

    assert_eq!(
        hub.tool_names().await,
        vec!["hub_proxies", "only_b", "shared"]
    );
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_proxy_id_is_denied_and_disconnected() {
    let hub = TestHub::initialized().await;
    let _first = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;

    let mut impostor = FakeProxy::connect(hub.mux_addr, "files").await;
    let response = impostor.register().await;
    assert_eq!(response["result"]["denied"], true);
    assert_eq!(response["result"]["sessionId"], "s-002");
    impostor.peer.expect_closed().await;
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_proxy_id_reusable_after_disconnect() {
    let mut hub = TestHub::initialized().await;
    let first = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;
    drop(first);
    hub.wait_for_tools(|names| !names.iter().any(|n| n == "read_file"))
        .await;

    let _again = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;
    assert!(hub.tool_names().await.contains(&"read_file".to_string()));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_tools_register_extends_the_list() {
    let mut hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;
    assert_eq!(hub.tool_names().await, vec!["hub_proxies", "read_file"]);

    let response = proxy.register_tools(&["write_file"]).await;
    assert_eq!(response["result"]["registered"], json!(["write_file"]));
    assert_eq!(
        hub.tool_names().await,
        vec!["hub_proxies", "read_file", "write_file"]
    );
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_proxy_registers_while_waiting_for_tcp_client() {
    let mut config = test_config();
    config.transport.kind = TransportKind::Tcp;
    config.transport.address = Some("127.0.0.1:0".into());
    let hub = Hub::bind(config).await.unwrap();
    let mux_addr = hub.mux_addr().unwrap();
    let registry = hub.registry().clone();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(hub.run_configured(cancel.clone()));

    let _proxy = tokio::time::timeout(
        RECV_TIMEOUT,
        FakeProxy::online(mux_addr, "files", &["read_file"]),
    )
    .await
    .expect("mux serves proxies before the client connects");
    assert!(registry.lookup("read_file").is_some());

    cancel.cancel();
    let stopped = tokio::time::timeout(RECV_TIMEOUT, handle)
        .await
        .expect("hub stops in time")
        .expect("hub task did not panic");
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_tools_register_before_proxy_register_is_method_not_found() {
    let hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::connect(hub.mux_addr, "files").await;

    let response = proxy.register_tools(&["read_file"]).await;
    assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);

    let pong = proxy.peer.call("ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let mut config = test_config();
    config.proxy.call_timeout_secs = 1;
    let mut hub = TestHub::start_with(config).await;
    hub.initialize().await;
    let mut proxy = FakeProxy::online(hub.mux_addr, "slow", &["sleep"]).await;

    hub.client
        .send(json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call", "params": {"name": "sleep"}}))
        .await;
    let forwarded = proxy.next_call().await;

    let response = hub.client.response_to(&json!(9)).await;
    assert_eq!(response["error"]["code"], INTERNAL_ERROR);

    // The late answer is dropped; the client sees nothing more for id 9.
    proxy.reply(&forwarded["id"], json!({"content": []})).await;
    let pong = hub.client.call("ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_connection_is_closed_after_timeout() {
    let mut config = test_config();
    config.proxy.registration_timeout_secs = 1;
    let hub = TestHub::start_with(config).await;

    let mut idle = FakeProxy::connect(hub.mux_addr, "idle").await;
    tokio::time::timeout(Duration::from_secs(5), idle.peer.expect_closed())
        .await
        .expect("hub closes idle connection");
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_errors() {
    let mut hub = TestHub::initialized().await;

    let response = hub
        .client
        .call("tools/call", json!({"name": "no_such_tool"}))
        .await;
    assert_eq!(response["error"]["code"], INVALID_PARAMS);

    let response = hub.client.call("resources/list", json!({})).await;
    assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);

    hub.client.send_raw("{not json").await;
    let response = hub
        .client
        .recv_matching(|m| m["error"]["code"] == PARSE_ERROR)
        .await;
    assert_eq!(response["id"], Value::Null);

    let pong = hub.client.call("ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_hub_proxies_lists_sessions() {
    let mut hub = TestHub::initialized().await;
    let _proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file", "write_file"]).await;

    let response = hub
        .client
        .call("tools/call", json!({"name": "hub_proxies", "arguments": {}}))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let body: Value = serde_json::from_str(text).unwrap();
    let session = &body["sessions"][0];
    assert_eq!(session["sessionId"], "s-001");
    assert_eq!(session["proxyId"], "files");
    assert_eq!(session["state"], "active");
    assert_eq!(session["toolCount"], 2);
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_hub_stops_when_client_disconnects() {
    let mut hub = TestHub::initialized().await;
    let mut proxy = FakeProxy::online(hub.mux_addr, "files", &["read_file"]).await;

    hub.client.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), hub.handle)
        .await
        .expect("hub stops after client EOF")
        .unwrap()
        .unwrap();

    proxy.peer.expect_closed().await;
}
