//! mcphub core: transport-level building blocks for the MCP hub.
//!
//! This library holds everything that does not depend on how the hub is
//! orchestrated:
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 classification, decoding and encoding
//! - [`transport`]: the byte-message [`transport::Transport`] abstraction and
//!   newline-delimited stream transports (stdio, TCP)
//! - [`rpc`]: the JSON-RPC transport (request id allocation, pending-request
//!   table, ordered receive loop)
//! - [`events`]: the hub event bus
//! - [`tools`]: the tools registry shared by every session
//! - [`config`]: YAML configuration loading and validation
//! - [`protocol`]: MCP method names and parameter/result types
//!
//! The `mcphub` crate composes these into the hub process.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod events;
pub mod inspector;
pub mod jsonrpc;
pub mod protocol;
pub mod rpc;
pub mod tools;
pub mod transport;

pub use error::{JsonRpcError, McpError};
pub use jsonrpc::{Message, Nature, Notification, Params, Request, RequestId, Response};
pub use rpc::{Incoming, JsonRpcTransport, MessageHandler, RpcError};
pub use transport::{Transport, TransportError, TransportEvent};
