//! Running hub plus fake proxies.

use std::net::SocketAddr;
use std::sync::Arc;

use mcphub::{Hub, HubError};
use mcphub_core::Transport;
use mcphub_core::config::Config;
use mcphub_core::transport::LineTransport;
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::line_peer::{LinePeer, RECV_TIMEOUT};

pub type TestClient = LinePeer<DuplexStream>;

/// A hub serving one in-memory client.
pub struct TestHub {
    pub client: TestClient,
    pub mux_addr: SocketAddr,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), HubError>>,
}

/// Config with the mux on an ephemeral loopback port.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.name = "test-hub".into();
    config.proxy.enabled = true;
    config.proxy.listen_address = Some("127.0.0.1:0".into());
    config
}

impl TestHub {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: Config) -> Self {
        let hub = Hub::bind(config).await.expect("hub binds");
        let mux_addr = hub.mux_addr().expect("mux enabled");

        let (client_side, hub_side) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(hub_side);
        let transport: Arc<dyn Transport> =
            Arc::new(LineTransport::new("test-client", reader, writer));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(hub.run(transport, cancel.clone()));

        Self {
            client: LinePeer::new(client_side),
            mux_addr,
            cancel,
            handle,
        }
    }

    /// Start a hub and complete the client's initialize handshake.
    pub async fn initialized() -> Self {
        let mut hub = Self::start().await;
        hub.initialize().await;
        hub
    }

    pub async fn initialize(&mut self) -> Value {
        let response = self
            .client
            .call(
                "initialize",
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "0.0.1"}
                }),
            )
            .await;
        self.client
            .notify("notifications/initialized", json!({}))
            .await;
        // Requests are handled in order, so once this is answered the
        // notification above has been processed too.
        self.client.call("ping", json!({})).await;
        response
    }

    pub async fn tool_names(&mut self) -> Vec<String> {
        let response = self.client.call("tools/list", json!({})).await;
        response["result"]["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect()
    }

    /// Poll `tools/list` until `pred` holds.
    pub async fn wait_for_tools(&mut self, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let names = self.tool_names().await;
            if pred(&names) {
                return names;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "tool list never matched, last seen: {names:?}"
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    pub async fn stop(self) -> Result<(), HubError> {
        self.cancel.cancel();
        tokio::time::timeout(RECV_TIMEOUT, self.handle)
            .await
            .expect("hub stops in time")
            .expect("hub task did not panic")
    }
}

/// A proxy process as seen from the hub.
pub struct FakeProxy {
    pub peer: LinePeer<TcpStream>,
    pub proxy_id: String,
}

pub fn tool_def(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {"type": "object"}
    })
}

impl FakeProxy {
    pub async fn connect(addr: SocketAddr, proxy_id: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("mux accepts");
        Self {
            peer: LinePeer::new(stream),
            proxy_id: proxy_id.to_string(),
        }
    }

    /// Send `proxy/register` and return the full response.
    pub async fn register(&mut self) -> Value {
        let params = json!({
            "protocolVersion": "2025-06-18",
            "proxyId": self.proxy_id,
            "persistent": false,
            "proxy": {
                "workingDirectory": "/tmp",
                "command": "fake-server",
                "args": ["--stdio"]
            },
            "serverInfo": {"name": format!("{}-server", self.proxy_id), "version": "1.0.0"}
        });
        self.peer.call("proxy/register", params).await
    }

    /// Send `tools/register` and return the full response.
    pub async fn register_tools(&mut self, names: &[&str]) -> Value {
        let tools: Vec<Value> = names.iter().map(|n| tool_def(n)).collect();
        self.peer.call("tools/register", json!({ "tools": tools })).await
    }

    /// Connect, register and publish `tools`.
    pub async fn online(addr: SocketAddr, proxy_id: &str, tools: &[&str]) -> Self {
        let mut proxy = Self::connect(addr, proxy_id).await;
        let registered = proxy.register().await;
        assert_eq!(registered["result"]["denied"], false, "{registered}");
        let response = proxy.register_tools(tools).await;
        assert!(response.get("result").is_some(), "{response}");
        proxy
    }

    /// Wait for a forwarded `tools/call`.
    pub async fn next_call(&mut self) -> Value {
        let request = self.peer.request().await;
        assert_eq!(request["method"], "tools/call");
        request
    }

    pub async fn reply(&mut self, id: &Value, result: Value) {
        self.peer
            .send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn reply_error(&mut self, id: &Value, code: i64, message: &str) {
        self.peer
            .send(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}))
            .await;
    }
}
