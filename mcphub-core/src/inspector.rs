//! Traffic inspection tap.
//!
//! An [`Inspector`] observes every frame crossing a JSON-RPC transport. It
//! cannot alter or block traffic; it exists for debugging multi-proxy setups
//! where it is otherwise hard to tell which peer sent what.

use std::fmt;

/// Which way a frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        })
    }
}

/// Observer of raw JSON-RPC frames.
///
/// Called inline on the transport's send and receive paths, so
/// implementations must be cheap and must not block.
pub trait Inspector: Send + Sync {
    /// Name for logging/debugging.
    fn name(&self) -> &'static str;

    /// Observe one frame on `channel` (a transport label).
    fn inspect(&self, channel: &str, direction: Direction, frame: &[u8]);
}

/// Logs each frame at `debug` under the `mcphub::inspector` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInspector;

impl Inspector for TracingInspector {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn inspect(&self, channel: &str, direction: Direction, frame: &[u8]) {
        tracing::debug!(
            target: "mcphub::inspector",
            channel,
            direction = %direction,
            bytes = frame.len(),
            frame = %String::from_utf8_lossy(frame),
        );
    }
}
