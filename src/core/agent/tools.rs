//! Tool definitions, argument validation and dispatch.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use similar::{ChangeTag, TextDiff};
use tokio_util::sync::CancellationToken;

use super::error::{AgentError, Result};
use super::events::{EventSink, LoopEvent};
use super::types::Tool;
use crate::core::backend::{CommandEvent, ConnectionManager};
use crate::core::cloud::{KvWorkerRegistry, WorkerProvider};
use crate::core::kv::KvStore;
use crate::core::navigator::Navigator;
use crate::core::session::{Session, ToolStatus};
use crate::core::todo::{ManageTodoArgs, TodoEvent, TodoLog, TodoOp};

/// Captured command output kept for the model, in bytes. Older output is dropped.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Result recorded on calls stopped by a cancelled turn.
pub const CANCELLED: &str = "cancelled";

/// Every tool the model may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    WriteFile,
    ReadFile,
    ListDirectory,
    RunCommand,
    RunPlaywright,
    ManageTodo,
    NavigatePage,
    CloudKvOp,
    CloudWorkerOp,
}

impl ToolName {
    pub const ALL: [Self; 9] = [
        Self::WriteFile,
        Self::ReadFile,
        Self::ListDirectory,
        Self::RunCommand,
        Self::RunPlaywright,
        Self::ManageTodo,
        Self::NavigatePage,
        Self::CloudKvOp,
        Self::CloudWorkerOp,
    ];

    /// Wire name as seen by the model.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WriteFile => "writeFile",
            Self::ReadFile => "readFile",
            Self::ListDirectory => "listDirectory",
            Self::RunCommand => "runCommand",
            Self::RunPlaywright => "runPlaywright",
            Self::ManageTodo => "manage_todo",
            Self::NavigatePage => "navigate_page",
            Self::CloudKvOp => "cloud_kv_op",
            Self::CloudWorkerOp => "cloud_worker_op",
        }
    }

    /// Look up a wire name.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnknownTool`] for names outside the closed set.
    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `cloud_kv_op` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
    List,
}

/// `cloud_worker_op` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOp {
    List,
    Create { name: String, code: String },
    Delete { name: String },
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    WriteFile { path: String, contents: String },
    ReadFile { path: String },
    ListDirectory { path: String },
    RunCommand { command: String, args: Vec<String> },
    RunPlaywright { test_path: Option<String> },
    ManageTodo(TodoOp),
    NavigatePage { url: String },
    CloudKvOp(KvOp),
    CloudWorkerOp(WorkerOp),
}

impl ToolRequest {
    #[must_use]
    pub const fn name(&self) -> ToolName {
        match self {
            Self::WriteFile { .. } => ToolName::WriteFile,
            Self::ReadFile { .. } => ToolName::ReadFile,
            Self::ListDirectory { .. } => ToolName::ListDirectory,
            Self::RunCommand { .. } => ToolName::RunCommand,
            Self::RunPlaywright { .. } => ToolName::RunPlaywright,
            Self::ManageTodo(_) => ToolName::ManageTodo,
            Self::NavigatePage { .. } => ToolName::NavigatePage,
            Self::CloudKvOp(_) => ToolName::CloudKvOp,
            Self::CloudWorkerOp(_) => ToolName::CloudWorkerOp,
        }
    }
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    #[serde(alias = "content")]
    contents: String,
}

#[derive(Deserialize)]
struct PathArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct RunCommandArgs {
    command: String,
    #[serde(default)]
    args: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RunPlaywrightArgs {
    #[serde(default, rename = "testPath")]
    test_path: Option<String>,
}

#[derive(Deserialize)]
struct NavigateArgs {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum KvAction {
    Get,
    Set,
    Del,
    List,
}

#[derive(Deserialize)]
struct KvArgs {
    action: KvAction,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum WorkerAction {
    List,
    Create,
    Delete,
}

#[derive(Deserialize)]
struct WorkerArgs {
    action: WorkerAction,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(tool: ToolName, input: &serde_json::Value) -> Result<T> {
    serde_json::from_value(input.clone()).map_err(|e| invalid(tool, e.to_string()))
}

fn invalid(tool: ToolName, reason: impl Into<String>) -> AgentError {
    AgentError::InvalidArguments {
        tool: tool.as_str().to_string(),
        reason: reason.into(),
    }
}

fn non_empty(tool: ToolName, field: &str, value: Option<String>) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| invalid(tool, format!("{field} must be a non-empty string")))
}

/// Validate a tool call's name and arguments.
///
/// `call_id` becomes the id of a todo created without one.
///
/// # Errors
///
/// Returns [`AgentError::UnknownTool`] or [`AgentError::InvalidArguments`]; nothing has
/// run when either is returned.
pub fn prepare(name: &str, input: &serde_json::Value, call_id: &str) -> Result<ToolRequest> {
    let tool = ToolName::parse(name)?;
    let request = match tool {
        ToolName::WriteFile => {
            let args: WriteFileArgs = decode(tool, input)?;
            ToolRequest::WriteFile {
                path: non_empty(tool, "path", Some(args.path))?,
                contents: args.contents,
            }
        }
        ToolName::ReadFile => {
            let args: PathArgs = decode(tool, input)?;
            ToolRequest::ReadFile {
                path: non_empty(tool, "path", args.path)?,
            }
        }
        ToolName::ListDirectory => {
            let args: PathArgs = decode(tool, input)?;
            ToolRequest::ListDirectory {
                path: args
                    .path
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| ".".to_string()),
            }
        }
        ToolName::RunCommand => {
            let args: RunCommandArgs = decode(tool, input)?;
            let command = non_empty(tool, "command", Some(args.command))?;
            match args.args {
                Some(args) => ToolRequest::RunCommand {
                    command: command.trim().to_string(),
                    args,
                },
                None => {
                    let mut words = command.split_whitespace().map(str::to_string);
                    let program = words.next().unwrap_or_default();
                    ToolRequest::RunCommand {
                        command: program,
                        args: words.collect(),
                    }
                }
            }
        }
        ToolName::RunPlaywright => {
            let args: RunPlaywrightArgs = decode(tool, input)?;
            ToolRequest::RunPlaywright {
                test_path: args.test_path.filter(|p| !p.trim().is_empty()),
            }
        }
        ToolName::ManageTodo => {
            let args: ManageTodoArgs = decode(tool, input)?;
            ToolRequest::ManageTodo(args.into_op(call_id).map_err(|e| invalid(tool, e))?)
        }
        ToolName::NavigatePage => {
            let args: NavigateArgs = decode(tool, input)?;
            let url = non_empty(tool, "url", Some(args.url))?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(tool, "url must start with http:// or https://"));
            }
            ToolRequest::NavigatePage { url }
        }
        ToolName::CloudKvOp => {
            let args: KvArgs = decode(tool, input)?;
            ToolRequest::CloudKvOp(match args.action {
                KvAction::List => KvOp::List,
                KvAction::Get => KvOp::Get {
                    key: non_empty(tool, "key", args.key)?,
                },
                KvAction::Del => KvOp::Del {
                    key: non_empty(tool, "key", args.key)?,
                },
                KvAction::Set => {
                    let key = non_empty(tool, "key", args.key)?;
                    let value = match args.value {
                        Some(serde_json::Value::String(s)) => s,
                        Some(serde_json::Value::Null) | None => {
                            return Err(invalid(tool, "set requires value"));
                        }
                        Some(other) => other.to_string(),
                    };
                    KvOp::Set { key, value }
                }
            })
        }
        ToolName::CloudWorkerOp => {
            let args: WorkerArgs = decode(tool, input)?;
            ToolRequest::CloudWorkerOp(match args.action {
                WorkerAction::List => WorkerOp::List,
                WorkerAction::Create => WorkerOp::Create {
                    name: non_empty(tool, "name", args.name)?,
                    code: non_empty(tool, "code", args.code)?,
                },
                WorkerAction::Delete => WorkerOp::Delete {
                    name: non_empty(tool, "name", args.name)?,
                },
            })
        }
    };
    Ok(request)
}

/// Published tool schemas.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn definitions() -> Vec<Tool> {
    let tool = |name: ToolName, description: &str, input_schema: serde_json::Value| Tool {
        name: name.as_str().to_string(),
        description: description.to_string(),
        input_schema,
    };

    vec![
        tool(
            ToolName::WriteFile,
            "Write content to a file in the project sandbox, creating parent directories.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path relative to the project root" },
                    "contents": { "type": "string", "description": "Full file contents" }
                },
                "required": ["path", "contents"]
            }),
        ),
        tool(
            ToolName::ReadFile,
            "Read the content of a file in the project sandbox.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        ),
        tool(
            ToolName::ListDirectory,
            "List a directory in the project sandbox. Directories come first.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory path (default: project root)" }
                }
            }),
        ),
        tool(
            ToolName::RunCommand,
            "Run a command in the project sandbox terminal, e.g. `npm install` or `npm run dev`.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Program to run, or a full command line when args is omitted" },
                    "args": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["command"]
            }),
        ),
        tool(
            ToolName::RunPlaywright,
            "Run Playwright end-to-end tests in the project sandbox.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "testPath": { "type": "string", "description": "Optional path to a specific test file" }
                }
            }),
        ),
        tool(
            ToolName::ManageTodo,
            "Manage the project roadmap. Create entries for planned steps and mark them completed as you go.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["create", "update", "delete"] },
                    "id": { "type": "string", "description": "Todo id; required for update and delete" },
                    "text": { "type": "string", "description": "Todo description; required for create" },
                    "status": { "type": "string", "enum": ["pending", "completed"] }
                },
                "required": ["action"]
            }),
        ),
        tool(
            ToolName::NavigatePage,
            "Load a URL (usually the running dev server) and report status, title and detected issues.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string" }
                },
                "required": ["url"]
            }),
        ),
        tool(
            ToolName::CloudKvOp,
            "Read or write the app's cloud key-value store.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["get", "set", "del", "list"] },
                    "key": { "type": "string" },
                    "value": { "description": "Value to store; non-strings are stored as JSON" }
                },
                "required": ["action"]
            }),
        ),
        tool(
            ToolName::CloudWorkerOp,
            "Deploy, list or delete serverless workers.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["list", "create", "delete"] },
                    "name": { "type": "string", "description": "Worker name: lowercase letters, digits, dashes" },
                    "code": { "type": "string", "description": "Worker source; required for create" }
                },
                "required": ["action"]
            }),
        ),
    ]
}

/// Per-turn state a dispatch needs besides the session.
pub struct ToolContext<'a> {
    pub todos: &'a mut TodoLog,
    pub cancel: &'a CancellationToken,
    pub events: &'a EventSink,
}

enum HandlerOutcome {
    Done(Result<String>),
    Cancelled,
    TimedOut(Duration),
}

/// Executes validated tool calls against the sandbox and cloud services.
pub struct ToolRegistry {
    backends: Arc<ConnectionManager>,
    navigator: Arc<Navigator>,
    kv: Arc<dyn KvStore>,
    workers: Arc<dyn WorkerProvider>,
    timeout: Option<Duration>,
}

impl ToolRegistry {
    /// Registry with a fresh navigator and the KV-backed worker registry.
    #[must_use]
    pub fn new(backends: Arc<ConnectionManager>, kv: Arc<dyn KvStore>) -> Self {
        let workers = Arc::new(KvWorkerRegistry::new(kv.clone()));
        Self {
            backends,
            navigator: Arc::new(Navigator::new()),
            kv,
            workers,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_navigator(mut self, navigator: Arc<Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: Arc<dyn WorkerProvider>) -> Self {
        self.workers = workers;
        self
    }

    /// Bound each handler. `None` lets handlers run until they finish or the turn is cancelled.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn backends(&self) -> &Arc<ConnectionManager> {
        &self.backends
    }

    #[must_use]
    pub fn navigator(&self) -> &Arc<Navigator> {
        &self.navigator
    }

    /// Tool schemas sent to the model.
    #[must_use]
    pub fn definitions(&self) -> Vec<Tool> {
        definitions()
    }

    /// Run one pending call on the session's tail message to a terminal status.
    ///
    /// Validation failures and handler errors are recorded on the call. A cancelled
    /// turn records [`CANCELLED`] and discards whatever the handler produced.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::BackendUnavailable`] after recording it on the call, and
    /// session errors when the call cannot be found or updated.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        message_index: usize,
        call_id: &str,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolStatus> {
        let call = session
            .messages()
            .get(message_index)
            .and_then(|m| m.tool_call(call_id))
            .ok_or_else(|| {
                crate::core::session::SessionError::ToolCallNotFound(call_id.to_string())
            })?;
        let (name, input, created_at) = (call.name.clone(), call.input.clone(), call.created_at);

        if ctx.cancel.is_cancelled() {
            self.finish(session, message_index, call_id, ToolStatus::Error, CANCELLED, ctx)?;
            return Ok(ToolStatus::Error);
        }

        let request = match prepare(&name, &input, call_id) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "rejected tool call");
                self.finish(session, message_index, call_id, ToolStatus::Error, &e.to_string(), ctx)?;
                return Ok(ToolStatus::Error);
            }
        };

        let call = session.update_tool_call_status(message_index, call_id, ToolStatus::Running, None)?;
        ctx.events.emit(LoopEvent::ToolCallUpdated {
            message_index,
            call: call.clone(),
        });

        let project_id = session.project_id().to_string();
        let outcome = match request {
            ToolRequest::ManageTodo(op) => {
                if ctx.cancel.is_cancelled() {
                    HandlerOutcome::Cancelled
                } else {
                    HandlerOutcome::Done(Self::manage_todo(ctx, call_id, created_at, op))
                }
            }
            other => {
                let work = self.execute(&project_id, call_id, other, ctx.events);
                let bounded = async {
                    match self.timeout {
                        Some(limit) => match tokio::time::timeout(limit, work).await {
                            Ok(result) => HandlerOutcome::Done(result),
                            Err(_) => HandlerOutcome::TimedOut(limit),
                        },
                        None => HandlerOutcome::Done(work.await),
                    }
                };
                tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => HandlerOutcome::Cancelled,
                    outcome = bounded => {
                        if ctx.cancel.is_cancelled() { HandlerOutcome::Cancelled } else { outcome }
                    }
                }
            }
        };

        match outcome {
            HandlerOutcome::Done(Ok(output)) => {
                self.finish(session, message_index, call_id, ToolStatus::Success, &output, ctx)?;
                Ok(ToolStatus::Success)
            }
            HandlerOutcome::Done(Err(e)) if e.is_fatal() => {
                self.finish(session, message_index, call_id, ToolStatus::Error, &e.to_string(), ctx)?;
                Err(e)
            }
            HandlerOutcome::Done(Err(e)) => {
                self.finish(session, message_index, call_id, ToolStatus::Error, &e.to_string(), ctx)?;
                Ok(ToolStatus::Error)
            }
            HandlerOutcome::Cancelled => {
                self.finish(session, message_index, call_id, ToolStatus::Error, CANCELLED, ctx)?;
                Ok(ToolStatus::Error)
            }
            HandlerOutcome::TimedOut(limit) => {
                let reason = format!("timed out after {}s", limit.as_secs());
                self.finish(session, message_index, call_id, ToolStatus::Error, &reason, ctx)?;
                Ok(ToolStatus::Error)
            }
        }
    }

    #[allow(clippy::unused_self)]
    fn finish(
        &self,
        session: &mut Session,
        message_index: usize,
        call_id: &str,
        status: ToolStatus,
        result: &str,
        ctx: &ToolContext<'_>,
    ) -> Result<()> {
        let call =
            session.update_tool_call_status(message_index, call_id, status, Some(result.to_string()))?;
        ctx.events.emit(LoopEvent::ToolCallUpdated {
            message_index,
            call: call.clone(),
        });
        Ok(())
    }

    fn manage_todo(ctx: &mut ToolContext<'_>, call_id: &str, timestamp: i64, op: TodoOp) -> Result<String> {
        ctx.todos
            .append(TodoEvent {
                tool_call_id: call_id.to_string(),
                timestamp,
                op,
            })
            .map_err(|e| AgentError::ToolExecution(e.to_string()))?;
        ctx.events.emit(LoopEvent::TodosChanged {
            items: ctx.todos.items().to_vec(),
        });
        Ok(ctx.todos.render())
    }

    async fn execute(
        &self,
        project_id: &str,
        call_id: &str,
        request: ToolRequest,
        events: &EventSink,
    ) -> Result<String> {
        tracing::info!(tool = %request.name(), project_id = %project_id, "executing tool");
        match request {
            ToolRequest::WriteFile { path, contents } => {
                self.write_file(project_id, &path, &contents, events).await
            }
            ToolRequest::ReadFile { path } => {
                let backend = self.backends.backend(project_id).await?;
                Ok(backend.read_file(&path).await?)
            }
            ToolRequest::ListDirectory { path } => {
                let backend = self.backends.backend(project_id).await?;
                let entries = backend.list_directory(&path).await?;
                if entries.is_empty() {
                    return Ok(format!("{path} is empty"));
                }
                Ok(entries
                    .iter()
                    .map(|e| {
                        if e.is_dir {
                            format!("{}/", e.name)
                        } else {
                            e.name.clone()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            ToolRequest::RunCommand { command, args } => {
                self.run_command(project_id, call_id, &command, &args, events)
                    .await
            }
            ToolRequest::RunPlaywright { test_path } => {
                let mut args = vec!["playwright".to_string(), "test".to_string()];
                args.extend(test_path);
                self.run_command(project_id, call_id, "npx", &args, events)
                    .await
            }
            ToolRequest::NavigatePage { url } => {
                let visit = self
                    .navigator
                    .navigate(&url)
                    .await
                    .map_err(|e| AgentError::ToolExecution(e.to_string()))?;
                let title = visit.title.as_deref().unwrap_or("(no title)");
                Ok(format!(
                    "Navigated to {}: HTTP {} in {}ms, {} bytes, title: {title}\n{}",
                    visit.url,
                    visit.status,
                    visit.duration_ms,
                    visit.bytes,
                    self.navigator.bug_report()
                ))
            }
            ToolRequest::CloudKvOp(op) => self.kv_op(project_id, op).await,
            ToolRequest::CloudWorkerOp(op) => self.worker_op(op).await,
            ToolRequest::ManageTodo(_) => Err(AgentError::ToolExecution(
                "manage_todo is applied by the dispatcher".to_string(),
            )),
        }
    }

    async fn write_file(
        &self,
        project_id: &str,
        path: &str,
        contents: &str,
        events: &EventSink,
    ) -> Result<String> {
        let backend = self.backends.backend(project_id).await?;
        events.log(format!("onyx-app $ Updating file {path}"));

        let previous = backend.read_file(path).await.ok();
        backend.write_file(path, contents).await?;

        Ok(match previous {
            None => format!("Created {path} ({} lines)", contents.lines().count()),
            Some(old) => {
                let (added, removed) = line_changes(&old, contents);
                format!("Updated {path} (+{added} -{removed})")
            }
        })
    }

    async fn run_command(
        &self,
        project_id: &str,
        call_id: &str,
        command: &str,
        args: &[String],
        events: &EventSink,
    ) -> Result<String> {
        let backend = self.backends.backend(project_id).await?;
        let line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        events.log(format!("onyx-app $ {line}"));

        let mut stream = backend.run_command(command, args).await?;
        let mut output = OutputBuffer::default();
        let mut exit_code = None;
        while let Some(event) = stream.next().await {
            match event? {
                CommandEvent::Output(chunk) => {
                    output.push(&chunk);
                    events.emit(LoopEvent::ToolOutput {
                        call_id: call_id.to_string(),
                        chunk,
                    });
                }
                CommandEvent::Exit(code) => exit_code = Some(code),
            }
        }

        let code = exit_code.ok_or_else(|| {
            AgentError::ToolExecution(format!("{command} ended without an exit code"))
        })?;
        Ok(format!("exit code {code}\n{}", output.finish()))
    }

    async fn kv_op(&self, project_id: &str, op: KvOp) -> Result<String> {
        let prefix = format!("app_{project_id}_");
        match op {
            KvOp::Get { key } => Ok(self
                .kv
                .get(&format!("{prefix}{key}"))
                .await?
                .unwrap_or_else(|| "null".to_string())),
            KvOp::Set { key, value } => {
                self.kv.set(&format!("{prefix}{key}"), &value).await?;
                Ok(format!("Stored {key}"))
            }
            KvOp::Del { key } => {
                self.kv.del(&format!("{prefix}{key}")).await?;
                Ok(format!("Deleted {key}"))
            }
            KvOp::List => {
                let keys: Vec<String> = self
                    .kv
                    .list()
                    .await?
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                    .collect();
                Ok(serde_json::to_string(&keys).map_err(|e| AgentError::Parse(e.to_string()))?)
            }
        }
    }

    async fn worker_op(&self, op: WorkerOp) -> Result<String> {
        let external = |e: crate::core::cloud::WorkerError| AgentError::ExternalApi(e.to_string());
        match op {
            WorkerOp::List => {
                let workers = self.workers.list().await.map_err(external)?;
                Ok(serde_json::to_string(&workers).map_err(|e| AgentError::Parse(e.to_string()))?)
            }
            WorkerOp::Create { name, code } => {
                let info = self.workers.create(&name, &code).await.map_err(external)?;
                Ok(format!("Deployed {} at {}", info.name, info.url))
            }
            WorkerOp::Delete { name } => {
                self.workers.delete(&name).await.map_err(external)?;
                Ok(format!("Deleted worker {name}"))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("backends", &self.backends)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Count added and removed lines between two versions of a file.
fn line_changes(old: &str, new: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(old, new);
    diff.iter_all_changes()
        .fold((0, 0), |(added, removed), change| match change.tag() {
            ChangeTag::Insert => (added + 1, removed),
            ChangeTag::Delete => (added, removed + 1),
            ChangeTag::Equal => (added, removed),
        })
}

/// Keeps the most recent [`MAX_OUTPUT_BYTES`] of command output.
#[derive(Default)]
struct OutputBuffer {
    text: String,
    truncated: bool,
}

impl OutputBuffer {
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > MAX_OUTPUT_BYTES {
            let mut cut = self.text.len() - MAX_OUTPUT_BYTES;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }

    fn finish(self) -> String {
        if self.truncated {
            format!("[earlier output truncated]\n{}", self.text)
        } else {
            self.text
        }
    }
}
