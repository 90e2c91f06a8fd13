//! Newline-delimited transports over async byte streams.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use super::ndjson::{MAX_MESSAGE_BYTES, bounded_read_line, trim_line};
use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportError, TransportEvent};

/// A [`Transport`] framing messages as lines over a reader/writer pair.
///
/// The reader is moved into a background task on [`Transport::start`]; the
/// writer is shared behind an async mutex so concurrent senders never
/// interleave partial lines.
pub struct LineTransport<R, W> {
    name: String,
    reader: parking_lot::Mutex<Option<R>>,
    writer: Mutex<Option<W>>,
    cancel: CancellationToken,
    max_message_bytes: usize,
}

/// Transport bound to the process's stdin/stdout.
pub type StdioTransport = LineTransport<tokio::io::Stdin, tokio::io::Stdout>;

/// Transport bound to one accepted or connected TCP stream.
pub type TcpTransport = LineTransport<OwnedReadHalf, OwnedWriteHalf>;

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(name: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            name: name.into(),
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            cancel: CancellationToken::new(),
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }

    /// Override the per-message size cap.
    #[must_use]
    pub fn with_max_message_bytes(mut self, max_bytes: usize) -> Self {
        self.max_message_bytes = max_bytes;
        self
    }
}

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new("stdio", tokio::io::stdin(), tokio::io::stdout())
    }
}

impl TcpTransport {
    pub fn tcp(stream: TcpStream) -> Self {
        let name = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        let (reader, writer) = stream.into_split();
        Self::new(name, reader, writer)
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| TransportError::AlreadyStarted {
                name: self.name.clone(),
            })?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = self.cancel.clone();
        let max_bytes = self.max_message_bytes;
        let name = self.name.clone();

        tokio::spawn(async move {
            read_loop(&name, reader, max_bytes, &tx, cancel).await;
            let _ = tx.send(TransportEvent::Closed).await;
        });

        Ok(rx)
    }

    async fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        let closed = || TransportError::Closed {
            name: self.name.clone(),
        };
        if self.cancel.is_cancelled() {
            return Err(closed());
        }

        let mut line = Vec::with_capacity(message.len() + 1);
        line.extend_from_slice(message);
        line.push(b'\n');

        // A peer that stops reading must not pin the writer lock past close().
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(closed()),
            result = async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or_else(closed)?;
                writer.write_all(&line).await?;
                writer.flush().await?;
                Ok::<(), TransportError>(())
            } => result,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(transport = %self.name, error = %e, "writer shutdown failed");
            }
        }
        Ok(())
    }
}

/// Read lines until EOF, a fatal error, cancellation, or the consumer
/// dropping the event channel.
async fn read_loop<R: AsyncRead + Unpin>(
    name: &str,
    reader: R,
    max_bytes: usize,
    tx: &mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(transport = %name, "read loop cancelled");
                return;
            }
            read = bounded_read_line(&mut reader, &mut buf, max_bytes) => read,
        };

        let event = match read {
            Ok(0) => {
                tracing::debug!(transport = %name, "peer closed the stream");
                return;
            }
            Ok(_) => {
                let line = trim_line(&buf);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                TransportEvent::Message(line.to_vec())
            }
            Err(e) => {
                let recoverable = e.is_recoverable();
                if tx.send(TransportEvent::Error(e.into())).await.is_err() || !recoverable {
                    return;
                }
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}
