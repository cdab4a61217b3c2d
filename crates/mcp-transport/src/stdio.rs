use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use mcp_types::{McpError, Message};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::lifecycle::Lifecycle;
use crate::read_buffer::ReadBuffer;
use crate::transport::{CloseCallback, ErrorCallback, MessageCallback, SendOptions, Transport};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Configuration for spawning a child server process and wiring its stdio
/// into a [`StdioTransport`]: plain fields, `Default` plus setter methods,
/// no generic config framework.
#[derive(Clone, Debug, Default)]
pub struct StdioTransportConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl StdioTransportConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Builds the `tokio::process::Command` this config describes: stdin,
    /// stdout, and stderr all piped, killed on drop so an aborted transport
    /// never leaves an orphaned server process behind.
    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

/// Classifies a line of child-process stderr output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StderrClass {
    /// Log and continue; the transport keeps running.
    Warning,
    /// Terminate the transport and surface the line as an error.
    Fatal,
}

pub type StderrClassifier = Arc<dyn Fn(&str) -> StderrClass + Send + Sync>;

fn default_stderr_classifier() -> StderrClassifier {
    Arc::new(|_line| StderrClass::Warning)
}

struct Inner<W> {
    lifecycle: Lifecycle,
    sink: AsyncMutex<W>,
    on_message: StdMutex<Option<MessageCallback>>,
    on_error: StdMutex<Vec<ErrorCallback>>,
    reader_handle: StdMutex<Option<JoinHandle<()>>>,
    stderr_handle: StdMutex<Option<JoinHandle<()>>>,
    source: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    stderr: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    stderr_classifier: StdMutex<StderrClassifier>,
    // Kept alive for spawned transports so `kill_on_drop` only fires when the
    // transport itself (and every clone of it) is dropped, not immediately
    // after `spawn()` returns. `None` for transports built over pre-opened
    // streams via `new()`.
    child: StdMutex<Option<Child>>,
}

impl<W> Inner<W> {
    fn emit_error(&self, err: McpError) {
        let callbacks = self.on_error.lock().expect("on_error lock poisoned").clone();
        for cb in callbacks {
            cb(err_clone(&err));
        }
    }

    fn dispatch_message(&self, message: Message) {
        let guard = self.on_message.lock().expect("on_message lock poisoned");
        if let Some(cb) = guard.as_ref() {
            cb(message);
        }
    }
}

fn err_clone(err: &McpError) -> McpError {
    // McpError doesn't derive Clone (some variants wrap non-Clone sources);
    // reconstruct an equivalent error object for fan-out to multiple sinks.
    McpError::InternalError(err.to_string())
}

/// Stdio transport: a pair of byte streams, one inbound (`source`, e.g. a
/// child process's stdout) and one outbound (`sink`, e.g. its stdin).
///
/// Output writes are serialized by a mutex and flushed per message. If a
/// stderr stream is supplied, each line is classified by a pluggable
/// predicate: `Warning` lines are logged and ignored, `Fatal` lines
/// terminate the transport. An empty/EOF stderr implies no further
/// classification, not an error.
///
/// Internally a thin handle around `Arc<Inner<W>>` so that the reader and
/// stderr tasks spawned from `start(&self)` can hold their own strong
/// reference without reconstructing one from a raw pointer.
pub struct StdioTransport<W> {
    inner: Arc<Inner<W>>,
}

// Manual impl: `Arc<Inner<W>>` is `Clone` regardless of `W`, but
// `#[derive(Clone)]` would add a spurious `W: Clone` bound that real sinks
// (e.g. a child process's stdin) don't satisfy.
impl<W> Clone for StdioTransport<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W> StdioTransport<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        source: impl AsyncRead + Send + Unpin + 'static,
        sink: W,
        stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: Lifecycle::new(),
                sink: AsyncMutex::new(sink),
                on_message: StdMutex::new(None),
                on_error: StdMutex::new(Vec::new()),
                reader_handle: StdMutex::new(None),
                stderr_handle: StdMutex::new(None),
                source: StdMutex::new(Some(Box::new(source))),
                stderr: StdMutex::new(stderr),
                stderr_classifier: StdMutex::new(default_stderr_classifier()),
                child: StdMutex::new(None),
            }),
        }
    }

    /// Overrides the stderr classification predicate. Has no effect on a
    /// stderr read already in flight; call before `start`.
    pub fn with_stderr_classifier(self, classifier: StderrClassifier) -> Self {
        *self.inner.stderr_classifier.lock().expect("stderr classifier lock poisoned") = classifier;
        self
    }
}

impl StdioTransport<tokio::process::ChildStdin> {
    /// Spawns a child server process per `config` and wires its stdout,
    /// stdin, and stderr into a new transport. The spawned `Child` is kept
    /// inside the transport so the process lives exactly as long as the
    /// transport does; dropping the last clone kills it via `kill_on_drop`.
    pub fn spawn(config: &StdioTransportConfig) -> Result<Self, McpError> {
        let mut child = config.to_command().spawn().map_err(|e| {
            McpError::InternalError(format!("failed to spawn {}: {e}", config.command.display()))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::InternalError("spawned child missing piped stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::InternalError("spawned child missing piped stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::InternalError("spawned child missing piped stderr".into()))?;

        let transport = Self::new(stdout, stdin, Some(Box::new(stderr)));
        *transport.inner.child.lock().expect("child lock poisoned") = Some(child);
        Ok(transport)
    }
}

#[async_trait]
impl<W> Transport for StdioTransport<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn start(&self) -> Result<(), McpError> {
        let source = self
            .inner
            .source
            .lock()
            .expect("source lock poisoned")
            .take()
            .ok_or_else(|| McpError::InternalError("stdio transport already started".into()))?;
        let stderr = self.inner.stderr.lock().expect("stderr lock poisoned").take();

        self.inner.lifecycle.start(|| async { Ok(()) }).await?;

        let reader_inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            read_loop(source, reader_inner).await;
        });
        *self.inner.reader_handle.lock().expect("reader handle lock poisoned") = Some(reader);

        if let Some(stderr) = stderr {
            let stderr_inner = self.inner.clone();
            let handle = tokio::spawn(async move {
                stderr_loop(stderr, stderr_inner).await;
            });
            *self.inner.stderr_handle.lock().expect("stderr handle lock poisoned") = Some(handle);
        }

        Ok(())
    }

    async fn send(&self, message: Message, _options: Option<SendOptions>) -> Result<(), McpError> {
        self.inner.lifecycle.ensure_operational()?;
        let text = message.to_json_string().map_err(McpError::from)?;
        let mut sink = self.inner.sink.lock().await;
        sink.write_all(text.as_bytes())
            .await
            .map_err(|e| McpError::InternalError(e.to_string()))?;
        sink.write_all(b"\n")
            .await
            .map_err(|e| McpError::InternalError(e.to_string()))?;
        sink.flush()
            .await
            .map_err(|e| McpError::InternalError(e.to_string()))
    }

    async fn close(&self) -> Result<(), McpError> {
        let reader = self.inner.reader_handle.lock().expect("reader handle lock poisoned").take();
        let stderr = self.inner.stderr_handle.lock().expect("stderr handle lock poisoned").take();
        self.inner
            .lifecycle
            .close(|| async move {
                if let Some(handle) = reader {
                    handle.abort();
                }
                if let Some(handle) = stderr {
                    handle.abort();
                }
                Ok(())
            })
            .await
    }

    fn on_message(&self, callback: MessageCallback) {
        *self.inner.on_message.lock().expect("on_message lock poisoned") = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.inner.on_error.lock().expect("on_error lock poisoned").push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.inner.lifecycle.register_close_callback(callback);
    }
}

async fn read_loop<W>(mut source: Box<dyn AsyncRead + Send + Unpin>, inner: Arc<Inner<W>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    use tokio::io::AsyncReadExt;
    let mut read_buffer = ReadBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) => {
                debug!("stdio transport reached EOF on stdin");
                break;
            }
            Ok(n) => {
                read_buffer.append(&chunk[..n]);
                while let Some(message) = read_buffer.read_message() {
                    inner.dispatch_message(message);
                }
            }
            Err(e) => {
                inner.emit_error(McpError::InternalError(e.to_string()));
                break;
            }
        }
    }
    let stderr_handle = inner.stderr_handle.lock().expect("stderr handle lock poisoned").take();
    inner
        .lifecycle
        .close(|| async move {
            if let Some(handle) = stderr_handle {
                handle.abort();
            }
            Ok(())
        })
        .await
        .ok();
}

async fn stderr_loop<W>(mut stderr: Box<dyn AsyncRead + Send + Unpin>, inner: Arc<Inner<W>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    use tokio::io::AsyncReadExt;
    let mut read_buffer = ReadBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break, // EOF implies no error.
            Ok(n) => {
                read_buffer.append(&chunk[..n]);
                // Process at most one stderr message per reader wakeup, then
                // drop the rest of the chunk's buffered lines: this mirrors
                // the upstream behavior of reading one stderr line and
                // clearing before the next wakeup rather than draining fully.
                if let Some(line) = read_buffer.read_line() {
                    let classifier = inner.stderr_classifier.lock().expect("stderr classifier lock poisoned").clone();
                    match classifier(&line) {
                        StderrClass::Warning => warn!("child stderr: {line}"),
                        StderrClass::Fatal => {
                            inner.emit_error(McpError::InternalError(format!(
                                "fatal stderr line: {line}"
                            )));
                            read_buffer.clear();
                            inner.lifecycle.close(|| async { Ok(()) }).await.ok();
                            return;
                        }
                    }
                }
                read_buffer.clear();
            }
            Err(_) => break,
        }
    }
}
