//! mcphub: an MCP hub aggregating tools from many proxy processes.
//!
//! The hub exposes one MCP endpoint to a client (stdio or TCP) and accepts
//! any number of proxy connections on a TCP multiplexer. Each proxy registers
//! itself and its tool catalog; the client sees the union of all catalogs and
//! its `tools/call` requests are forwarded to the owning proxy under a fresh,
//! proxy-local request id.
//!
//! - [`hub`]: composition root and structured task orchestration
//! - [`server`]: the client-facing MCP request handler
//! - [`mux`]: proxy listener, live session set and per-proxy sessions
//! - [`router`]: id remapping for forwarded tool calls
//! - [`builtin`]: tools implemented by the hub itself

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod builtin;
pub mod cli;
pub mod error;
pub mod hub;
pub mod mux;
pub mod router;
pub mod server;

pub use error::{HubError, MuxError, SessionError};
pub use hub::Hub;
