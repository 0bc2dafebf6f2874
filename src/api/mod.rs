//! HTTP API exposing projects, transcripts and turns to the web UI.

// Allow clippy lint triggered by utoipa's OpenApi derive macro
#![allow(clippy::needless_for_each)]

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::core::agent::{AgentError, EventSink, TurnOutcome};
use crate::core::backend::{BackendError, ConnectionStatus};
use crate::core::github::GitHubError;
use crate::core::project::Project;
use crate::core::session::{ActivityEntry, Message};
use crate::core::todo::TodoItem;
use crate::core::{Error, Workspace};

/// Shared application state.
pub struct AppState {
    /// Projects and the turns running on them.
    pub workspace: Arc<Workspace>,

    /// API token for authentication (if configured).
    pub token: Option<String>,
}

type SharedState = Arc<AppState>;

/// `OpenAPI` documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Onyx API",
        description = "Projects, transcripts and agent turns for the Onyx web UI",
        version = "0.1.0",
        license(name = "MIT")
    ),
    paths(
        health,
        list_projects,
        create_project,
        delete_project,
        get_messages,
        get_todos,
        get_activity,
        chat,
        cancel_turn,
        backend_status,
        restart_backend
    ),
    components(schemas(
        CreateProjectRequest,
        ChatRequest,
        CancelResponse,
        RestartRequest,
        ErrorBody,
        Project,
        TodoItem,
        ActivityEntry,
        ConnectionStatus
    ))
)]
struct ApiDoc;

/// Error payload for every non-2xx response.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// A core error with the HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    const fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::ProjectNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::TurnInProgress(_) => (StatusCode::CONFLICT, "turn_in_progress"),
            Error::Agent(AgentError::BackendUnavailable(_))
            | Error::Backend(BackendError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
            }
            Error::GitHub(GitHubError::MissingToken) => (StatusCode::UNAUTHORIZED, "missing_token"),
            Error::Agent(_) | Error::GitHub(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            Error::Backend(_) | Error::Kv(_) | Error::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: error.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Authentication middleware.
///
/// Validates the `Authorization: Bearer <token>` header if a token is configured.
async fn auth_middleware(
    State(state): State<SharedState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    // If no token configured, allow all requests (localhost-only mode)
    let Some(expected_token) = state.token.as_deref() else {
        return next.run(request).await;
    };

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match auth_header {
        Some(token) if token == expected_token => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthorized".to_string(),
                message: "Missing or invalid Authorization header. Use: Bearer <token>"
                    .to_string(),
            }),
        )
            .into_response(),
    }
}

/// Build the router: protected `/api` routes, public health and docs.
pub fn router(state: SharedState) -> Router {
    let protected_routes = Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", axum::routing::delete(delete_project))
        .route("/api/projects/{id}/messages", get(get_messages))
        .route("/api/projects/{id}/todos", get(get_todos))
        .route("/api/projects/{id}/activity", get(get_activity))
        .route("/api/projects/{id}/chat", post(chat))
        .route("/api/projects/{id}/cancel", post(cancel_turn))
        .route("/api/backend", get(backend_status))
        .route("/api/backend/restart", post(restart_backend))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let public_routes = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", ApiDoc::openapi()));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .with_state(state)
        // Auth is bearer-only, so any origin may call
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP API server.
///
/// # Errors
///
/// Returns an error if the server fails to bind or start.
pub async fn serve(
    workspace: Arc<Workspace>,
    token: Option<String>,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let auth_enabled = token.is_some();
    let app = router(Arc::new(AppState { workspace, token }));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    if auth_enabled {
        tracing::info!(addr = %addr, "starting HTTP API server (auth enabled)");
    } else {
        tracing::warn!(addr = %addr, "starting HTTP API server (NO AUTH - localhost only recommended)");
    }

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service healthy", body = String))
)]
async fn health() -> &'static str {
    "ok"
}

/// Request body for project creation.
#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct CreateProjectRequest {
    /// Display name; random when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// Starter template.
    #[serde(default)]
    pub template: Option<String>,
}

/// Request body for a chat turn.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CancelResponse {
    /// Whether a running turn was signalled.
    pub cancelled: bool,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RestartRequest {
    pub project_id: String,
}

/// Terminal SSE event closing a chat stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEnd {
    /// The turn finished.
    Done { outcome: TurnOutcome },
    /// The turn failed.
    Error { message: String },
}

/// List projects, most recently updated first.
#[utoipa::path(
    get,
    path = "/api/projects",
    responses((status = 200, description = "Projects", body = Vec<Project>))
)]
async fn list_projects(State(state): State<SharedState>) -> ApiResult<Json<Vec<Project>>> {
    let projects = state
        .workspace
        .projects()
        .list()
        .await
        .map_err(Error::from)?;
    Ok(Json(projects))
}

/// Create a project.
#[utoipa::path(
    post,
    path = "/api/projects",
    request_body = CreateProjectRequest,
    responses((status = 201, description = "Project created", body = Project))
)]
async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = state.workspace.create_project(req.name, req.template).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// Delete a project and its session.
#[utoipa::path(
    delete,
    path = "/api/projects/{id}",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 204, description = "Project deleted"),
        (status = 404, description = "Unknown project", body = ErrorBody)
    )
)]
async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.workspace.delete_project(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Project transcript in conversation order.
#[utoipa::path(
    get,
    path = "/api/projects/{id}/messages",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "Transcript", body = Vec<Message>),
        (status = 404, description = "Unknown project", body = ErrorBody)
    )
)]
async fn get_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(state.workspace.messages(&id).await?))
}

/// Project roadmap.
#[utoipa::path(
    get,
    path = "/api/projects/{id}/todos",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "Roadmap", body = Vec<TodoItem>),
        (status = 404, description = "Unknown project", body = ErrorBody)
    )
)]
async fn get_todos(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<TodoItem>>> {
    Ok(Json(state.workspace.todos(&id).await?))
}

/// Reasoning and tool calls, newest first.
#[utoipa::path(
    get,
    path = "/api/projects/{id}/activity",
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "Activity feed", body = Vec<ActivityEntry>),
        (status = 404, description = "Unknown project", body = ErrorBody)
    )
)]
async fn get_activity(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ActivityEntry>>> {
    Ok(Json(state.workspace.activity(&id).await?))
}

/// Run a turn and stream its loop events.
///
/// Each SSE `data` is a JSON loop event tagged by `type`; the stream ends with a
/// `done` or `error` event. The turn keeps running if the client disconnects.
#[utoipa::path(
    post,
    path = "/api/projects/{id}/chat",
    params(("id" = String, Path, description = "Project id")),
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Event stream", body = String, content_type = "text/event-stream"),
        (status = 404, description = "Unknown project", body = ErrorBody),
        (status = 409, description = "A turn is already running", body = ErrorBody)
    )
)]
async fn chat(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.workspace.project(&id).await?;
    if state.workspace.is_running(&id) {
        return Err(Error::TurnInProgress(id).into());
    }

    let (events, mut rx) = EventSink::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let workspace = state.workspace.clone();

    tokio::spawn(async move {
        let result = workspace.chat(&id, &req.message, events).await;
        let _ = done_tx.send(result);
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }

        let end = match done_rx.await {
            Ok(Ok(outcome)) => StreamEnd::Done { outcome },
            Ok(Err(e)) => StreamEnd::Error { message: e.to_string() },
            Err(_) => StreamEnd::Error { message: "turn aborted".to_string() },
        };
        let data = serde_json::to_string(&end).unwrap_or_default();
        yield Ok(Event::default().data(data));
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Cancel the project's running turn.
#[utoipa::path(
    post,
    path = "/api/projects/{id}/cancel",
    params(("id" = String, Path, description = "Project id")),
    responses((status = 200, description = "Cancellation result", body = CancelResponse))
)]
async fn cancel_turn(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.workspace.cancel(&id),
    })
}

/// Current backend connection.
#[utoipa::path(
    get,
    path = "/api/backend",
    responses((status = 200, description = "Connection status", body = ConnectionStatus))
)]
async fn backend_status(State(state): State<SharedState>) -> Json<ConnectionStatus> {
    Json(state.workspace.backend_status().await)
}

/// Tear down the backend and boot it again for a project.
#[utoipa::path(
    post,
    path = "/api/backend/restart",
    request_body = RestartRequest,
    responses((status = 200, description = "Connection status after restart", body = ConnectionStatus))
)]
async fn restart_backend(
    State(state): State<SharedState>,
    Json(req): Json<RestartRequest>,
) -> ApiResult<Json<ConnectionStatus>> {
    Ok(Json(state.workspace.restart_backend(&req.project_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use crate::core::AgentLoop;
    use crate::core::agent::{ScriptedProvider, ScriptedResponse, ToolRegistry};
    use crate::core::backend::{ConnectionManager, LocalConnector};
    use crate::core::kv::{KvStore, MemoryKv};
    use crate::core::session::{ModelConfig, SessionStore};

    struct TestApp {
        app: Router,
        workspace: Arc<Workspace>,
        _dir: tempfile::TempDir,
    }

    fn create_test_app(token: Option<String>, responses: Vec<ScriptedResponse>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let backends = Arc::new(ConnectionManager::new(Arc::new(LocalConnector::new(
            dir.path().to_path_buf(),
            false,
        ))));
        let tools = Arc::new(ToolRegistry::new(backends, kv.clone()));
        let agent = AgentLoop::new(
            Arc::new(ScriptedProvider::new(responses)),
            tools,
            SessionStore::new(kv),
        );
        let workspace = Arc::new(Workspace::new(agent, ModelConfig::default()));
        let app = router(Arc::new(AppState {
            workspace: workspace.clone(),
            token,
        }));
        TestApp {
            app,
            workspace,
            _dir: dir,
        }
    }

    async fn body_string(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let test = create_test_app(None, Vec::new());
        let response = test.app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_middleware_allows_request_when_no_token_configured() {
        let test = create_test_app(None, Vec::new());
        let response = test.app.oneshot(get("/api/projects")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_middleware_rejects_invalid_token() {
        let test = create_test_app(Some("secret-token".to_string()), Vec::new());

        let response = test.app.clone().oneshot(get("/api/projects")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/projects")
            .header("Authorization", "Bearer wrong-token")
            .body(Body::empty())
            .unwrap();
        let response = test.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_middleware_allows_valid_token() {
        let test = create_test_app(Some("secret-token".to_string()), Vec::new());
        let request = Request::builder()
            .uri("/api/projects")
            .header("Authorization", "Bearer secret-token")
            .body(Body::empty())
            .unwrap();
        let response = test.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn created_projects_are_listed() {
        let test = create_test_app(None, Vec::new());

        let response = test
            .app
            .clone()
            .oneshot(post_json("/api/projects", r#"{"name": "Todo App"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Project = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(created.name, "Todo App");

        let response = test.app.oneshot(get("/api/projects")).await.unwrap();
        let projects: Vec<Project> = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(projects, vec![created]);
    }

    #[tokio::test]
    async fn unknown_project_is_404() {
        let test = create_test_app(None, Vec::new());
        let response = test
            .app
            .oneshot(get("/api/projects/nope/messages"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body.error, "not_found");
    }

    #[tokio::test]
    async fn chat_streams_events_and_persists_transcript() {
        let test = create_test_app(None, vec![ScriptedResponse::text("Hello from Onyx")]);
        let project = test.workspace.create_project(None, None).await.unwrap();

        let response = test
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/chat", project.id),
                r#"{"message": "hi"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert!(body.contains(r#""type":"message_appended""#));
        assert!(body.contains("Hello from Onyx"));
        assert!(body.contains(r#""type":"done""#));
        assert!(body.contains(r#""stop":"completed""#));

        let response = test
            .app
            .oneshot(get(&format!("/api/projects/{}/messages", project.id)))
            .await
            .unwrap();
        let messages: Vec<Message> = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn cancel_without_running_turn_reports_false() {
        let test = create_test_app(None, Vec::new());
        let response = test
            .app
            .oneshot(post_json("/api/projects/abc/cancel", "{}"))
            .await
            .unwrap();
        let body: CancelResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(!body.cancelled);
    }

    #[tokio::test]
    async fn restart_boots_the_backend() {
        let test = create_test_app(None, Vec::new());
        let response = test
            .app
            .oneshot(post_json("/api/backend/restart", r#"{"project_id": "demo"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: ConnectionStatus = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(matches!(status, ConnectionStatus::Connected { .. }));
    }

    #[test]
    fn stream_end_serializes_with_type_tag() {
        let json = serde_json::to_string(&StreamEnd::Error {
            message: "oops".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"oops"}"#);
    }

    #[test]
    fn openapi_lists_project_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/projects/{id}/chat"));
        assert!(doc.paths.paths.contains_key("/api/backend/restart"));
    }
}
