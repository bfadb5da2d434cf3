//! Line-delimited JSON transport.
//!
//! Handles the byte-level side of talking to a JSON-RPC peer over pipes:
//! - `LineFramer` splits an arbitrarily chunked byte stream into JSON messages
//! - `pump_lines` drives a framer from an `AsyncRead` until EOF
//! - `LineWriter` serializes messages as single, atomically written lines

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::errors::McpError;

/// Read size for each chunk pulled off the pipe.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on shutting down the writer in `close()`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Boxed write half, so child stdin and in-memory pipes share one type.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Incremental newline framer.
///
/// Bytes are buffered until a `\n` arrives; each complete line is trimmed,
/// empty lines are skipped, and the rest are decoded as JSON. A line that
/// fails to decode yields a `ParseError` and never affects its neighbours.
#[derive(Debug)]
pub struct LineFramer {
    server_name: String,
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            buffer: Vec::new(),
        }
    }

    /// Append a chunk and return every message it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<serde_json::Value, McpError>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            let frame = serde_json::from_slice(trimmed).map_err(|e| McpError::ParseError {
                server: self.server_name.clone(),
                reason: format!("{e} in line: {}", String::from_utf8_lossy(trimmed)),
            });
            frames.push(frame);
        }
        frames
    }

    /// Bytes received after the last newline.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Read `reader` to EOF, feeding every decoded frame to `on_frame`.
///
/// Returns `Ok(())` on a clean EOF. A trailing line without its newline is
/// dropped, matching how a peer that dies mid-write is treated.
pub async fn pump_lines<R, F>(
    mut reader: R,
    framer: &mut LineFramer,
    mut on_frame: F,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Result<serde_json::Value, McpError>),
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if framer.pending_bytes() > 0 {
                tracing::debug!(
                    server = %framer.server_name,
                    bytes = framer.pending_bytes(),
                    "discarding unterminated trailing line"
                );
            }
            return Ok(());
        }
        for frame in framer.push(&chunk[..n]) {
            on_frame(frame);
        }
    }
}

// ─── Writing ─────────────────────────────────────────────────────────────────

struct WriterState {
    writer: BoxedWriter,
    /// A send was cancelled after writing part of its line.
    torn: bool,
}

/// Serialized line writer shared by concurrent senders.
///
/// The lock is held for the full write + flush of one line, so lines from
/// different tasks never interleave. A send that is dropped mid-line leaves
/// the writer torn; the next send terminates the fragment first, so the
/// peer sees one bad line instead of a corrupted neighbour.
pub struct LineWriter {
    server_name: String,
    writer: Mutex<Option<WriterState>>,
    closed: AtomicBool,
}

impl LineWriter {
    pub fn new(server_name: &str, writer: BoxedWriter) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(WriterState {
                writer,
                torn: false,
            })),
            closed: AtomicBool::new(false),
        }
    }

    /// Serialize `message` and write it as one newline-terminated line.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut guard = self.writer.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.closed_error())?;

        if state.torn {
            tracing::debug!(server = %self.server_name, "terminating line left by a cancelled write");
            json.insert(0, '\n');
        }
        state.torn = true;

        state
            .writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write: {e}"),
            })?;
        state.writer.flush().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to flush: {e}"),
        })?;

        state.torn = false;
        Ok(())
    }

    /// Refuse further sends and shut the writer down.
    ///
    /// Never waits on an in-flight send: when one holds the lock, the
    /// writer is released once that send returns and the last handle drops.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let state = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                tracing::debug!(server = %self.server_name, "writer busy, skipping shutdown");
                return;
            }
        };
        if let Some(mut state) = state {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, state.writer.shutdown()).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: "pipe is closed".into(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
