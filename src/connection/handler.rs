//! Per-Client Worker
//!
//! Each accepted client gets one `ConnectionHandler` running on its own task:
//!
//! ```text
//!  ┌──────────────► read bytes into buffer ◄─── shutdown? ──► stop
//!  │                        │
//!  │                        ▼
//!  │            decode every complete frame
//!  │                        │
//!  │                        ▼
//!  └──── write reply ◄── dispatch
//! ```
//!
//! TCP is a byte stream, so one read may carry half a command or several
//! pipelined ones. Bytes accumulate in a `BytesMut` until the parser reports
//! a whole frame. A frame that can never parse is answered with the
//! dispatcher's empty-command error and the buffered bytes are dropped; the
//! connection stays open.
//!
//! Shutdown is observed between requests only, never while a request is
//! half processed.

use crate::commands::CommandHandler;
use crate::protocol::RespParser;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Largest amount of unparsed input buffered for one client (64 MB)
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Counters shared by every connection of one server.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Serves one client over any byte stream.
pub struct ConnectionHandler<S> {
    stream: BufWriter<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Bytes received but not yet decoded
    buffer: BytesMut,

    command_handler: CommandHandler,

    parser: RespParser,

    stats: Arc<ConnectionStats>,

    /// Flips to `true` when the server starts shutting down
    shutdown: watch::Receiver<bool>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: RespParser::new(),
            stats,
            shutdown,
        }
    }

    /// Serves the client until it disconnects, an I/O error occurs, or the
    /// server shuts down.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => debug!(client = %self.addr, "Connection closed by server shutdown"),
            Err(ConnectionError::ClientDisconnected) => {
                info!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(tokens) = self.next_frame() {
                if self.shutdown_requested() {
                    return Ok(());
                }

                let reply = self.command_handler.handle(&tokens);
                self.stats.command_processed();
                self.send_reply(&reply).await?;
            }

            if self.shutdown_requested() {
                return Ok(());
            }

            if self.buffer.len() >= MAX_BUFFER_SIZE {
                error!(
                    client = %self.addr,
                    size = self.buffer.len(),
                    "Buffer size limit exceeded"
                );
                return Err(ConnectionError::BufferFull);
            }
            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            let n = tokio::select! {
                read = self.stream.get_mut().read_buf(&mut self.buffer) => read?,
                _ = self.shutdown.changed() => return Ok(()),
            };

            if n == 0 {
                return if self.buffer.is_empty() {
                    Err(ConnectionError::ClientDisconnected)
                } else {
                    Err(ConnectionError::UnexpectedEof)
                };
            }

            self.stats.bytes_read(n);
            trace!(client = %self.addr, bytes = n, "Read data");
        }
    }

    /// Takes the next complete frame off the buffer.
    ///
    /// A malformed frame yields an empty token list and drops everything
    /// buffered, so the dispatcher answers it with its empty-command error.
    fn next_frame(&mut self) -> Option<Vec<Bytes>> {
        loop {
            match self.parser.parse(&self.buffer) {
                Ok(Some((tokens, consumed))) => {
                    let _ = self.buffer.split_to(consumed);
                    // Blank lines and `*0` carry no command and get no reply
                    if tokens.is_empty() {
                        continue;
                    }
                    trace!(
                        client = %self.addr,
                        consumed,
                        remaining = self.buffer.len(),
                        "Parsed command"
                    );
                    return Some(tokens);
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(client = %self.addr, error = %e, "Discarding malformed request");
                    self.buffer.clear();
                    return Some(Vec::new());
                }
            }
        }
    }

    async fn send_reply(&mut self, reply: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(reply).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(reply.len());
        trace!(client = %self.addr, bytes = reply.len(), "Sent reply");
        Ok(())
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Client disconnected")]
    ClientDisconnected,

    /// The peer closed the stream in the middle of a request
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Runs a [`ConnectionHandler`] to completion, logging how it ended.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats, shutdown);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
