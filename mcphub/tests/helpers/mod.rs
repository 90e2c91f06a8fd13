//! Test helpers for mcphub integration tests.
//!
//! - [`LinePeer`]: a newline-delimited JSON-RPC peer over any byte stream
//! - [`TestHub`]: a hub bound to an ephemeral mux port, with its client
//!   endpoint exposed as a [`LinePeer`] over an in-memory pipe
//! - [`FakeProxy`]: a proxy connected to the hub's mux over TCP

#![allow(unused_imports)] // Re-exports may not be used by all test files
#![allow(dead_code)]

pub mod harness;
pub mod line_peer;

pub use harness::*;
pub use line_peer::*;
