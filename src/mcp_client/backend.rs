//! Backend client: one MCP server process behind a multiplexed JSON-RPC pipe.
//!
//! A `BackendClient` owns:
//! - the child process (spawned with piped stdio) and an exit observer task
//! - a reader task that frames stdout into messages and resolves pending requests
//! - a shared line writer for stdin, so concurrent calls never interleave
//! - the pending-request table keyed by per-client request id
//! - the tool list discovered during the handshake
//!
//! Lifecycle: `Idle → Starting → Ready`, then `Crashed` (process exit),
//! `Failed` (start did not complete) or `Stopped` (explicit shutdown).
//! Terminal states are final; restarting means building a new client.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{pump_lines, BoxedReader, BoxedWriter, LineFramer, LineWriter};
use super::types::{
    BackendConfig, InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    ListToolsResult, McpToolDefinition, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a single tool call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default timeout for each handshake request.
///
/// Generous because some backends load large dependencies at startup.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop()` waits for the killed process to be reaped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Runtime options shared by every backend of one gateway.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub init_timeout: Duration,
    /// Fallback working directory when the backend has no `cwd`.
    pub working_dir: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            working_dir: None,
        }
    }
}

/// Lifecycle state of a backend client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Idle,
    Starting,
    Ready,
    /// Process exited on its own.
    Crashed,
    /// `start()` did not reach `Ready`.
    Failed,
    /// `stop()` was called.
    Stopped,
}

impl BackendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::Failed | Self::Stopped)
    }
}

type Outcome = Result<serde_json::Value, McpError>;

/// Handle on the spawned process, held until `stop()`.
struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
}

/// Pending-table slot owned by one in-flight request.
struct PendingEntry<'a> {
    pending: &'a Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    id: u64,
}

impl PendingEntry<'_> {
    /// Remove the entry; `true` if it was still there.
    fn remove(&self) -> bool {
        self.pending.lock().remove(&self.id).is_some()
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

// ─── BackendClient ───────────────────────────────────────────────────────────

/// Multiplexed JSON-RPC client for one backend process.
pub struct BackendClient {
    config: BackendConfig,
    options: ClientOptions,
    state: Mutex<BackendState>,
    tools: RwLock<Vec<McpToolDefinition>>,
    /// `request id → continuation`. Whoever removes an entry owns its outcome.
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    next_id: AtomicU64,
    writer: Mutex<Option<Arc<LineWriter>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<ProcessHandle>>,
    stderr_tail: Mutex<VecDeque<String>>,
}

impl BackendClient {
    pub fn new(config: BackendConfig, options: ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            config,
            options,
            state: Mutex::new(BackendState::Idle),
            tools: RwLock::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            process: Mutex::new(None),
            stderr_tail: Mutex::new(VecDeque::new()),
        })
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BackendState::Ready
    }

    /// Tools discovered during the handshake (empty before it completes).
    pub fn tools(&self) -> Vec<McpToolDefinition> {
        self.tools.read().clone()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// OS process id, while a process is attached.
    pub fn pid(&self) -> Option<u32> {
        self.process.lock().as_ref().and_then(|p| p.pid)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the backend process and run the handshake.
    ///
    /// Returns once the client is `Ready`, or with `SpawnFailed` /
    /// `InitFailed`. On failure the process is killed and the client is
    /// left in a terminal state.
    pub async fn start(self: &Arc<Self>) -> Result<(), McpError> {
        self.begin_start()?;

        let (stdout, stdin) = match self.spawn_process() {
            Ok(pipes) => pipes,
            Err(e) => {
                self.set_terminal(BackendState::Failed);
                tracing::error!(server = %self.config.name, error = %e, "failed to spawn backend");
                return Err(e);
            }
        };

        self.complete_start(stdout, stdin).await
    }

    /// Run the handshake over already-connected streams instead of a
    /// spawned process. End-of-stream on `reader` counts as a crash.
    pub async fn start_with_io(
        self: &Arc<Self>,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<(), McpError> {
        self.begin_start()?;
        self.complete_start(reader, writer).await
    }

    fn begin_start(&self) -> Result<(), McpError> {
        let mut state = self.state.lock();
        if *state != BackendState::Idle {
            return Err(McpError::InitFailed {
                name: self.config.name.clone(),
                reason: format!("client is {:?}, not idle", *state),
            });
        }
        *state = BackendState::Starting;
        Ok(())
    }

    async fn complete_start(
        self: &Arc<Self>,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<(), McpError> {
        let started = Instant::now();
        self.attach_io(reader, writer);

        match self.handshake().await {
            Ok(tool_count) => {
                let promoted = {
                    let mut state = self.state.lock();
                    if *state == BackendState::Starting {
                        *state = BackendState::Ready;
                        true
                    } else {
                        false
                    }
                };
                if !promoted {
                    self.teardown().await;
                    return Err(McpError::InitFailed {
                        name: self.config.name.clone(),
                        reason: format!("backend left startup as {:?}", self.state()),
                    });
                }
                tracing::info!(
                    server = %self.config.name,
                    tools = tool_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backend ready"
                );
                Ok(())
            }
            Err(e) => {
                self.set_terminal(BackendState::Failed);
                self.teardown().await;
                let stderr = self.stderr_snapshot();
                if !stderr.is_empty() {
                    tracing::warn!(
                        server = %self.config.name,
                        stderr = %stderr,
                        "backend stderr captured on failure"
                    );
                }
                let reason = format!("{e}{}", format_stderr_suffix(&stderr));
                tracing::error!(
                    server = %self.config.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    reason = %reason,
                    "backend failed to start"
                );
                Err(McpError::InitFailed {
                    name: self.config.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Stop the backend: reject in-flight requests, kill the process.
    ///
    /// Safe to call in any state and more than once.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if !state.is_terminal() {
                *state = BackendState::Stopped;
            }
            previous
        };

        if previous != BackendState::Stopped {
            tracing::info!(server = %self.config.name, state = ?previous, "stopping backend");
        }

        let name = self.config.name.clone();
        self.fail_pending(|| McpError::Stopped { name: name.clone() });
        self.teardown().await;
    }

    /// Release the process, the reader task and pipes. Idempotent.
    ///
    /// The kill goes out first and closing the writer never waits on a
    /// stalled send, so this always completes.
    async fn teardown(&self) {
        let process = self.process.lock().take();
        let exiting = process.map(|process| {
            let _ = process.kill_tx.send(());
            (process.pid, process.watcher)
        });

        let reader = self.reader_task.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.close().await;
        }

        if let Some((pid, watcher)) = exiting {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, watcher)
                .await
                .is_err()
            {
                tracing::warn!(
                    server = %self.config.name,
                    pid = ?pid,
                    "backend process did not exit after kill"
                );
            }
        }
    }

    fn set_terminal(&self, target: BackendState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = target;
        }
    }

    /// Transition to `Crashed` and reject every pending request.
    ///
    /// May run from the reader task or the exit observer at any point,
    /// including mid-handshake; only the first call has any effect.
    fn mark_crashed(&self, reason: &str) {
        let previous = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            let previous = *state;
            *state = BackendState::Crashed;
            previous
        };

        let name = self.config.name.clone();
        let rejected = self.fail_pending(|| McpError::ServerCrashed {
            name: name.clone(),
            reason: reason.to_string(),
        });

        tracing::error!(
            server = %self.config.name,
            previous = ?previous,
            rejected,
            reason,
            "backend crashed"
        );
    }

    /// Drain the pending table, rejecting each entry. Returns how many.
    fn fail_pending(&self, make_err: impl Fn() -> McpError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
        count
    }

    // ─── Process Plumbing ────────────────────────────────────────────────

    fn spawn_process(self: &Arc<Self>) -> Result<(BoxedReader, BoxedWriter), McpError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.envs(&self.config.env);

        // Per-backend cwd overrides the gateway-wide working_dir
        let effective_dir = self
            .config
            .cwd
            .as_deref()
            .or(self.options.working_dir.as_deref());
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: self.config.name.clone(),
            reason: format!("{} {}: {e}", self.config.command, self.config.args.join(" ")),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: self.config.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: self.config.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_sink(stderr);
        }

        let pid = child.id();
        tracing::info!(
            server = %self.config.name,
            command = %self.config.command,
            args = ?self.config.args,
            pid = ?pid,
            "spawned backend process"
        );

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let client = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("process exited with {status}"),
                        Err(e) => format!("failed to wait on process: {e}"),
                    };
                    client.mark_crashed(&reason);
                }
                _ = kill_rx => {
                    let _ = child.kill().await;
                    tracing::debug!(server = %client.config.name, "backend process killed");
                }
            }
        });

        *self.process.lock() = Some(ProcessHandle {
            pid,
            kill_tx,
            watcher,
        });

        Ok((Box::new(stdout), Box::new(stdin)))
    }

    /// Forward stderr to the log and keep a short tail for error messages.
    fn spawn_stderr_sink(self: &Arc<Self>, stderr: ChildStderr) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %client.config.name, "backend log: {}", line.trim_end());
                {
                    let mut tail = client.stderr_tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });
    }

    fn stderr_snapshot(&self) -> String {
        let tail = self.stderr_tail.lock();
        tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    fn attach_io(self: &Arc<Self>, reader: BoxedReader, writer: BoxedWriter) {
        *self.writer.lock() = Some(Arc::new(LineWriter::new(&self.config.name, writer)));

        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut framer = LineFramer::new(&client.config.name);
            let result = pump_lines(reader, &mut framer, |frame| client.handle_frame(frame)).await;
            let reason = match result {
                Ok(()) => "backend closed its stdout".to_string(),
                Err(e) => format!("failed to read backend stdout: {e}"),
            };
            client.mark_crashed(&reason);
        });
        *self.reader_task.lock() = Some(task);
    }

    // ─── Inbound Dispatch ────────────────────────────────────────────────

    fn handle_frame(&self, frame: Result<serde_json::Value, McpError>) {
        let value = match frame {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(server = %self.config.name, error = %e, "failed to parse message");
                return;
            }
        };

        match serde_json::from_value::<JsonRpcMessage>(value) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                tracing::warn!(
                    server = %self.config.name,
                    error = %e,
                    "message is not a JSON-RPC envelope"
                );
            }
        }
    }

    fn dispatch(&self, message: JsonRpcMessage) {
        let Some(id) = message.numeric_id() else {
            tracing::debug!(
                server = %self.config.name,
                method = ?message.method,
                "ignoring message without a numeric id"
            );
            return;
        };

        let Some(tx) = self.pending.lock().remove(&id) else {
            tracing::debug!(
                server = %self.config.name,
                id,
                "discarding response with no pending request"
            );
            return;
        };

        let outcome = match message.error {
            Some(err) => Err(McpError::ServerError {
                code: err.code,
                message: if err.message.is_empty() {
                    "unknown error from backend".to_string()
                } else {
                    err.message
                },
                data: err.data,
            }),
            None => Ok(message.result.unwrap_or(serde_json::Value::Null)),
        };
        // Receiver may have given up already; nothing else to do then.
        let _ = tx.send(outcome);
    }

    // ─── Outbound ────────────────────────────────────────────────────────

    fn current_writer(&self) -> Result<Arc<LineWriter>, McpError> {
        self.writer.lock().clone().ok_or_else(|| McpError::NotReady {
            name: self.config.name.clone(),
        })
    }

    /// Error for a request that cannot be accepted in the current state.
    fn unavailable_error(&self, state: BackendState) -> McpError {
        match state {
            BackendState::Stopped => McpError::Stopped {
                name: self.config.name.clone(),
            },
            BackendState::Crashed => McpError::ServerCrashed {
                name: self.config.name.clone(),
                reason: "backend is no longer running".into(),
            },
            _ => McpError::NotReady {
                name: self.config.name.clone(),
            },
        }
    }

    /// Send a request and wait for its response, the deadline, or a crash.
    ///
    /// One deadline covers both writing the line and waiting for the
    /// answer. `operation` labels the request in timeout errors and logs.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        operation: &str,
        timeout: Duration,
    ) -> Outcome {
        let writer = self.current_writer()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        self.pending.lock().insert(id, tx);
        // Removes the entry however this future ends, including when dropped.
        let entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        // A crash that drained the table before our insert already changed
        // the state; check after inserting so the entry cannot be stranded.
        let state = self.state();
        if state.is_terminal() {
            return Err(self.unavailable_error(state));
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let request = JsonRpcRequest::new(id, method, params);
        tracing::debug!(server = %self.config.name, id, method, "sending request");

        // A crash or stop resolves the entry even while the write is stuck.
        let written = tokio::select! {
            written = tokio::time::timeout_at(deadline, writer.send(&request)) => written,
            outcome = &mut rx => return outcome.unwrap_or_else(|_| Err(self.channel_closed())),
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if entry.remove() {
                    return Err(e);
                }
                // Someone else resolved the entry first; their outcome stands.
                return rx.await.unwrap_or_else(|_| Err(self.channel_closed()));
            }
            Err(_) => return self.expire(&entry, rx, operation, started).await,
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or_else(|_| Err(self.channel_closed())),
            Err(_) => self.expire(&entry, rx, operation, started).await,
        }
    }

    /// Deadline passed: claim the entry as a timeout, unless a response or
    /// crash claimed it first.
    async fn expire(
        &self,
        entry: &PendingEntry<'_>,
        rx: oneshot::Receiver<Outcome>,
        operation: &str,
        started: Instant,
    ) -> Outcome {
        if !entry.remove() {
            return rx.await.unwrap_or_else(|_| Err(self.channel_closed()));
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::warn!(
            server = %self.config.name,
            tool = operation,
            id = entry.id,
            elapsed_ms,
            "request timed out"
        );
        Err(McpError::Timeout {
            server: self.config.name.clone(),
            tool: operation.to_string(),
            elapsed_ms,
        })
    }

    fn channel_closed(&self) -> McpError {
        McpError::TransportError {
            server: self.config.name.clone(),
            reason: "response channel closed".into(),
        }
    }

    /// Write a notification; completes once the line is flushed.
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let writer = self.current_writer()?;
        tracing::debug!(server = %self.config.name, method, "sending notification");
        writer.send(&JsonRpcNotification::new(method, params)).await
    }

    /// `initialize` → `notifications/initialized` → `tools/list`.
    async fn handshake(&self) -> Result<usize, McpError> {
        let timeout = self.options.init_timeout;
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let init = self
            .request("initialize", Some(params), "initialize", timeout)
            .await?;

        if let Ok(info) = serde_json::from_value::<InitializeResult>(init) {
            tracing::debug!(
                server = %self.config.name,
                protocol = ?info.protocol_version,
                backend = ?info.server_info.and_then(|s| s.name),
                "initialize response"
            );
        }

        self.notify("notifications/initialized", None).await?;

        let listed = self
            .request("tools/list", Some(serde_json::json!({})), "tools/list", timeout)
            .await?;
        let list = if listed.is_null() {
            ListToolsResult { tools: Vec::new() }
        } else {
            serde_json::from_value::<ListToolsResult>(listed).map_err(|e| {
                McpError::InitFailed {
                    name: self.config.name.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                }
            })?
        };

        let tools = self.accept_tools(list.tools);
        let count = tools.len();
        *self.tools.write() = tools;
        Ok(count)
    }

    /// Keep only tools inside this backend's `{prefix}_` namespace.
    fn accept_tools(&self, tools: Vec<McpToolDefinition>) -> Vec<McpToolDefinition> {
        tools
            .into_iter()
            .filter(|tool| {
                let owned = self.config.owns_tool_name(&tool.name);
                if !owned {
                    tracing::warn!(
                        server = %self.config.name,
                        tool = %tool.name,
                        prefix = %self.config.prefix(),
                        "dropping tool outside the backend's prefix"
                    );
                }
                owned
            })
            .collect()
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Invoke `tools/call` and return the backend's `result` unchanged.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        if !self.is_ready() {
            return Err(McpError::NotReady {
                name: self.config.name.clone(),
            });
        }

        let start = Instant::now();
        tracing::info!(server = %self.config.name, tool = tool_name, "calling tool");

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self
            .request("tools/call", Some(params), tool_name, self.options.request_timeout)
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(
                server = %self.config.name,
                tool = tool_name,
                elapsed_ms,
                "tool completed"
            ),
            Err(e) => tracing::warn!(
                server = %self.config.name,
                tool = tool_name,
                elapsed_ms,
                error = %e,
                "tool failed"
            ),
        }
        result
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
