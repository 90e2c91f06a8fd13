//! Newline-delimited JSON-RPC peer used to drive the hub from tests.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};

/// How long a test waits for any single message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LinePeer<S> {
    lines: Lines<BufReader<ReadHalf<S>>>,
    writer: WriteHalf<S>,
    /// Messages read while waiting for something else.
    backlog: VecDeque<Value>,
    next_id: i64,
}

impl<S: AsyncRead + AsyncWrite> LinePeer<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            backlog: VecDeque::new(),
            next_id: 1,
        }
    }

    pub async fn send(&mut self, message: Value) {
        let mut line = serde_json::to_vec(&message).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next message off the wire, or `None` on EOF.
    pub async fn try_recv(&mut self) -> Option<Value> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(message);
        }
        self.read_wire().await
    }

    pub async fn recv(&mut self) -> Value {
        self.try_recv().await.expect("peer closed the connection")
    }

    async fn read_wire(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a message")
            .ok()??;
        Some(serde_json::from_str(&line).expect("peer sent invalid JSON"))
    }

    /// Read until a message matches, stashing the others for later.
    pub async fn recv_matching(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return self.backlog.remove(pos).unwrap();
        }
        loop {
            let message = self.read_wire().await.expect("peer closed the connection");
            if pred(&message) {
                return message;
            }
            self.backlog.push_back(message);
        }
    }

    /// Send a request under `id` and wait for its response.
    pub async fn call_with_id(&mut self, id: Value, method: &str, params: Value) -> Value {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        self.response_to(&id).await
    }

    /// Send a request under the next numeric id and wait for its response.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.call_with_id(json!(id), method, params).await
    }

    pub async fn response_to(&mut self, id: &Value) -> Value {
        let id = id.clone();
        self.recv_matching(move |m| m.get("method").is_none() && m["id"] == id)
            .await
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Wait for a notification with the given method.
    pub async fn notification(&mut self, method: &str) -> Value {
        let method = method.to_string();
        self.recv_matching(move |m| m["method"] == method.as_str() && m["id"].is_null())
            .await
    }

    /// Wait for a request (a message with both `method` and a non-null id).
    pub async fn request(&mut self) -> Value {
        self.recv_matching(|m| m.get("method").is_some() && !m["id"].is_null())
            .await
    }

    /// Wait for the remote side to close, discarding anything still sent.
    pub async fn expect_closed(&mut self) {
        self.backlog.clear();
        while self.read_wire().await.is_some() {}
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
