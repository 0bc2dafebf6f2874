//! Execution backends: the sandbox filesystem and process surface tools run against.
//!
//! Two variants share one contract. [`LocalSandbox`] keeps each project in a directory
//! on this machine; [`RemoteSandbox`] drives a hosted sandbox over HTTP. Callers only
//! ever hold an `Arc<dyn ExecutionBackend>` handed out by the [`ConnectionManager`].

mod local;
mod remote;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub use local::{LocalConnector, LocalSandbox};
pub use remote::{RemoteConnector, RemoteSandbox};

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Boot or connect failed. Sticky until the connection is reset.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// File or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path escapes the project root or is otherwise unusable.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with something we could not use.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Backend result type.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Which backend variant is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Per-project directory on this machine.
    #[default]
    Local,
    /// Hosted sandbox reached over HTTP.
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (no path).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Order entries directories first, then files, alphabetical within each group.
pub fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
}

/// One item of a running command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// A chunk of stdout or stderr, in arrival order.
    Output(String),
    /// The process exited. Always the last event.
    Exit(i32),
}

/// Lazy, finite stream of command output terminated by exactly one exit event.
///
/// The stream is consumed once; running the command again means calling
/// [`ExecutionBackend::run_command`] again.
pub struct CommandStream {
    inner: Pin<Box<dyn Stream<Item = Result<CommandEvent>> + Send>>,
    exited: bool,
}

impl CommandStream {
    /// Wrap a raw event stream.
    pub fn new(stream: impl Stream<Item = Result<CommandEvent>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
            exited: false,
        }
    }

    /// Drain the stream into the combined output and the exit code.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails or the stream ends without an exit code.
    pub async fn collect_output(mut self) -> Result<(String, i32)> {
        let mut output = String::new();
        while let Some(event) = self.next().await {
            match event? {
                CommandEvent::Output(chunk) => output.push_str(&chunk),
                CommandEvent::Exit(code) => return Ok((output, code)),
            }
        }
        Err(BackendError::Protocol(
            "command stream ended without an exit code".to_string(),
        ))
    }
}

impl Stream for CommandStream {
    type Item = Result<CommandEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.exited {
            return Poll::Ready(None);
        }
        let polled = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(CommandEvent::Exit(_)))) = &polled {
            self.exited = true;
        }
        polled
    }
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

/// Decodes a byte stream as UTF-8 across read boundaries.
///
/// A character split between two reads is held back until its remaining bytes
/// arrive. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` after whatever the previous push held back.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    if let Some(bad) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        self.pending.drain(..valid + bad);
                    } else {
                        // Incomplete trailing sequence; wait for more bytes.
                        self.pending.drain(..valid);
                        break;
                    }
                }
            }
        }
        out
    }

    /// Flush held-back bytes at end of input.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Uniform filesystem and process surface of a sandbox.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> BackendKind;

    /// Create or overwrite a text file, creating parent directories.
    async fn write_file(&self, path: &str, contents: &str) -> Result<()>;

    /// Read a text file. Fails with [`BackendError::NotFound`] if absent.
    async fn read_file(&self, path: &str) -> Result<String>;

    /// List a directory, ordered by [`sort_entries`].
    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Start a command in the project directory and stream its output.
    ///
    /// A non-zero exit is reported through [`CommandEvent::Exit`], not as an error.
    async fn run_command(&self, command: &str, args: &[String]) -> Result<CommandStream>;

    /// URL at which a dev server listening on `port` can be previewed.
    fn preview_url(&self, port: u16) -> String;

    /// Release any resources held by the connection.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// Boots or connects a backend for one project.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Which variant this connector produces.
    fn kind(&self) -> BackendKind;

    /// Boot a backend for `project_id`.
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn ExecutionBackend>>;
}

/// Externally visible connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Nothing booted yet, or reset.
    Disconnected,
    /// A live backend is memoized for this project.
    Connected { kind: String, project_id: String },
    /// The last boot failed. The next call boots again.
    Failed { project_id: String, reason: String },
}

enum ConnectionState {
    Disconnected,
    Connected {
        project_id: String,
        backend: Arc<dyn ExecutionBackend>,
    },
    Failed {
        project_id: String,
        reason: String,
    },
}

/// Owns the single live backend connection.
///
/// The state lock is held across `connect`, so a caller arriving while a boot is in
/// flight waits for that boot instead of starting a second one.
pub struct ConnectionManager {
    connector: Arc<dyn BackendConnector>,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    /// Create a manager around a connector. Nothing boots until first use.
    #[must_use]
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Backend variant this manager produces.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.connector.kind()
    }

    /// Get the backend for `project_id`, booting it on first use.
    ///
    /// Switching projects tears down the previous connection. A failed boot is
    /// returned as [`BackendError::Unavailable`] and leaves nothing memoized, so the
    /// next call boots again; [`Self::status`] keeps the reason until then.
    pub async fn backend(&self, project_id: &str) -> Result<Arc<dyn ExecutionBackend>> {
        let mut state = self.state.lock().await;

        match &*state {
            ConnectionState::Connected {
                project_id: current,
                backend,
            } if current == project_id => return Ok(Arc::clone(backend)),
            _ => {}
        }

        if let ConnectionState::Connected {
            project_id: previous,
            backend,
        } = std::mem::replace(&mut *state, ConnectionState::Disconnected)
        {
            tracing::info!(from = %previous, to = %project_id, "switching sandbox project");
            if let Err(e) = backend.teardown().await {
                tracing::warn!(project_id = %previous, error = %e, "sandbox teardown failed");
            }
        }

        tracing::info!(project_id = %project_id, kind = %self.kind(), "booting sandbox");
        match self.connector.connect(project_id).await {
            Ok(backend) => {
                *state = ConnectionState::Connected {
                    project_id: project_id.to_string(),
                    backend: Arc::clone(&backend),
                };
                Ok(backend)
            }
            Err(e) => {
                let reason = match e {
                    BackendError::Unavailable(reason) => reason,
                    other => other.to_string(),
                };
                tracing::error!(project_id = %project_id, reason = %reason, "sandbox boot failed");
                *state = ConnectionState::Failed {
                    project_id: project_id.to_string(),
                    reason: reason.clone(),
                };
                Err(BackendError::Unavailable(reason))
            }
        }
    }

    /// Drop the memoized connection or the last failure.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let ConnectionState::Connected {
            project_id,
            backend,
        } = std::mem::replace(&mut *state, ConnectionState::Disconnected)
        {
            if let Err(e) = backend.teardown().await {
                tracing::warn!(project_id = %project_id, error = %e, "sandbox teardown failed");
            }
        }
        tracing::info!("sandbox connection reset");
    }

    /// Reset, then boot again for `project_id`.
    pub async fn restart(&self, project_id: &str) -> Result<Arc<dyn ExecutionBackend>> {
        self.reset().await;
        self.backend(project_id).await
    }

    /// Snapshot of the connection state.
    pub async fn status(&self) -> ConnectionStatus {
        match &*self.state.lock().await {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connected {
                project_id,
                backend,
            } => ConnectionStatus::Connected {
                kind: backend.kind().to_string(),
                project_id: project_id.clone(),
            },
            ConnectionState::Failed { project_id, reason } => ConnectionStatus::Failed {
                project_id: project_id.clone(),
                reason: reason.clone(),
            },
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct NullBackend;

    #[async_trait]
    impl ExecutionBackend for NullBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn write_file(&self, _path: &str, _contents: &str) -> Result<()> {
            Ok(())
        }

        async fn read_file(&self, path: &str) -> Result<String> {
            Err(BackendError::NotFound(path.to_string()))
        }

        async fn list_directory(&self, _path: &str) -> Result<Vec<DirEntry>> {
            Ok(Vec::new())
        }

        async fn run_command(&self, _command: &str, _args: &[String]) -> Result<CommandStream> {
            Ok(CommandStream::new(futures::stream::iter(vec![Ok(
                CommandEvent::Exit(0),
            )])))
        }

        fn preview_url(&self, port: u16) -> String {
            format!("http://localhost:{port}")
        }
    }

    /// Fails the first `failures` boots, counting every attempt.
    struct CountingConnector {
        attempts: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl CountingConnector {
        fn new(failures: usize) -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                failures,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl BackendConnector for CountingConnector {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn connect(&self, _project_id: &str) -> Result<Arc<dyn ExecutionBackend>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if attempt < self.failures {
                return Err(BackendError::Unavailable("network error".to_string()));
            }
            Ok(Arc::new(NullBackend))
        }
    }

    #[test]
    fn sort_puts_directories_first() {
        let mut entries = vec![
            DirEntry {
                name: "b.js".to_string(),
                is_dir: false,
            },
            DirEntry {
                name: "src".to_string(),
                is_dir: true,
            },
            DirEntry {
                name: "a.js".to_string(),
                is_dir: false,
            },
            DirEntry {
                name: "public".to_string(),
                is_dir: true,
            },
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["public", "src", "a.js", "b.js"]);
    }

    #[tokio::test]
    async fn collect_output_joins_chunks() {
        let stream = CommandStream::new(futures::stream::iter(vec![
            Ok(CommandEvent::Output("hello ".to_string())),
            Ok(CommandEvent::Output("world".to_string())),
            Ok(CommandEvent::Exit(3)),
        ]));
        let (output, code) = stream.collect_output().await.unwrap();
        assert_eq!(output, "hello world");
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn collect_output_requires_exit() {
        let stream = CommandStream::new(futures::stream::iter(vec![Ok(CommandEvent::Output(
            "partial".to_string(),
        ))]));
        assert!(matches!(
            stream.collect_output().await,
            Err(BackendError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn stream_stops_after_exit() {
        let mut stream = CommandStream::new(futures::stream::iter(vec![
            Ok(CommandEvent::Exit(0)),
            Ok(CommandEvent::Output("late".to_string())),
        ]));
        assert_eq!(stream.next().await.unwrap().unwrap(), CommandEvent::Exit(0));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn backend_is_memoized() {
        let connector = Arc::new(CountingConnector::new(0));
        let manager = ConnectionManager::new(connector.clone());

        manager.backend("p1").await.unwrap();
        manager.backend("p1").await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_boot() {
        let connector = Arc::new(CountingConnector {
            delay: Duration::from_millis(50),
            ..CountingConnector::new(0)
        });
        let manager = Arc::new(ConnectionManager::new(connector.clone()));

        let (a, b) = tokio::join!(manager.backend("p1"), manager.backend("p1"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn boot_failure_retries_on_next_call() {
        let connector = Arc::new(CountingConnector::new(2));
        let manager = ConnectionManager::new(connector.clone());

        for attempt in 1..=2 {
            assert!(matches!(
                manager.backend("p1").await,
                Err(BackendError::Unavailable(_))
            ));
            assert_eq!(connector.attempts.load(Ordering::SeqCst), attempt);
            assert!(matches!(
                manager.status().await,
                ConnectionStatus::Failed { .. }
            ));
        }

        // No reset needed once the connector recovers.
        manager.backend("p1").await.unwrap();
        manager.backend("p1").await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(
            manager.status().await,
            ConnectionStatus::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn restart_after_failure_boots_again() {
        let connector = Arc::new(CountingConnector::new(1));
        let manager = ConnectionManager::new(connector.clone());

        assert!(manager.backend("p1").await.is_err());
        manager.restart("p1").await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn decoder_holds_split_characters() {
        let euro = "€".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"price: "), "price: ");
        assert_eq!(decoder.push(&euro[..1]), "");
        assert_eq!(decoder.push(&euro[1..2]), "");
        assert_eq!(decoder.push(&[euro[2], b'5']), "€5");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{fffd}b");
        // A truncated sequence left at end of input is flushed lossily.
        assert_eq!(decoder.push(&"€".as_bytes()[..2]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn switching_project_reconnects() {
        let connector = Arc::new(CountingConnector::new(0));
        let manager = ConnectionManager::new(connector.clone());

        manager.backend("p1").await.unwrap();
        manager.backend("p2").await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            manager.status().await,
            ConnectionStatus::Connected {
                kind: "local".to_string(),
                project_id: "p2".to_string(),
            }
        );
    }
}
