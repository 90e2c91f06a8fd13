//! Byte-message transports.
//!
//! A [`Transport`] moves opaque messages (one JSON document each) between the
//! hub and a peer. It knows nothing about JSON-RPC: classification and request
//! correlation happen one layer up in [`crate::rpc`].
//!
//! Implementations report inbound traffic through the channel returned by
//! [`Transport::start`]: a sequence of [`TransportEvent::Message`] and
//! recoverable [`TransportEvent::Error`]s, always terminated by exactly one
//! [`TransportEvent::Closed`].

pub mod ndjson;
pub mod stream;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use ndjson::{FramingError, MAX_MESSAGE_BYTES};
pub use stream::LineTransport;

/// Capacity of the inbound event channel for stream transports.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by a started transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound message, without its line terminator.
    Message(Vec<u8>),
    /// A read failure. Fatal errors are followed by [`TransportEvent::Closed`].
    Error(TransportError),
    /// The peer went away or the transport was closed. Always the last event.
    Closed,
}

/// Errors raised by transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport '{name}' already started")]
    AlreadyStarted { name: String },

    #[error("transport '{name}' is closed")]
    Closed { name: String },

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the transport keeps running after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Framing(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// A bidirectional byte-message channel.
///
/// This is the seam the JSON-RPC layer is written against; tests substitute
/// in-memory pipes for stdio and sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable label used in logs (`stdio`, a peer address, ...).
    fn name(&self) -> &str;

    /// Begin reading. May be called once.
    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Send one message. The transport adds its own framing.
    async fn send(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Stop reading and release the write side. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}
