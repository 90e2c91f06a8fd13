//! Newline-delimited JSON framing.
//!
//! One JSON document per line. Lines are read with a hard size cap so that a
//! misbehaving peer cannot make the reader buffer an unbounded amount of data.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Maximum size of a single framed message (10 MB).
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// How long to keep discarding the tail of an oversized line.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while reading one framed line.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A single line exceeds the configured maximum size.
    ///
    /// The remainder of the offending line has been discarded, so the reader
    /// is positioned at the start of the next message.
    #[error("Message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge { max_bytes: usize },

    /// An underlying IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the stream can keep being read after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FramingError::MessageTooLarge { .. })
    }
}

/// Read one newline-terminated line into `buf`, enforcing `max_bytes`.
///
/// Returns the number of bytes appended (including the newline), or `0` at
/// EOF. A final unterminated line is returned as-is.
pub async fn bounded_read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;

        if available.is_empty() {
            return Ok(total);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let to_consume = pos + 1;
                if total + to_consume > max_bytes {
                    reader.consume(to_consume);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }

                buf.extend_from_slice(&available[..to_consume]);
                total += to_consume;
                reader.consume(to_consume);
                return Ok(total);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    reader.consume(len);
                    drain_until_newline(reader).await;
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }

                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}

/// Discard bytes until a newline or EOF, bounded by [`DRAIN_TIMEOUT`].
async fn drain_until_newline<R: AsyncBufRead + Unpin>(reader: &mut R) {
    let drain = async {
        loop {
            match reader.fill_buf().await {
                Ok([]) => return,
                Ok(buf) => {
                    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        reader.consume(pos + 1);
                        return;
                    }
                    let len = buf.len();
                    reader.consume(len);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "IO error while draining oversized message");
                    return;
                }
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "timed out draining oversized message"
        );
    }
}

/// Strip the line terminator (`\n` or `\r\n`).
pub fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
