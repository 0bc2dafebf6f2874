//! Project-scoped entry points shared by the CLI and the HTTP API.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::agent::{AgentLoop, EventSink, TurnOutcome};
use super::backend::ConnectionStatus;
use super::error::{Error, Result};
use super::github::{self, GitHubClient, PushResult, Repository};
use super::kv::KvStore;
use super::project::{Project, ProjectIndex};
use super::session::{ActivityEntry, Message, ModelConfig, Session, SessionStore, activity};
use super::todo::{TodoItem, TodoLog};

/// Projects, their sessions, and the turns running on them.
///
/// At most one turn runs per project; [`Workspace::cancel`] stops it.
pub struct Workspace {
    agent: AgentLoop,
    projects: ProjectIndex,
    model: ModelConfig,
    running: Mutex<HashMap<String, CancellationToken>>,
}

/// Removes the turn's token however the turn ends, including when its future is dropped.
struct RunningTurn<'a> {
    running: &'a Mutex<HashMap<String, CancellationToken>>,
    project_id: String,
}

impl Drop for RunningTurn<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.project_id);
    }
}

impl Workspace {
    /// Sessions opened here use `model` regardless of what was stored with them.
    #[must_use]
    pub fn new(agent: AgentLoop, model: ModelConfig) -> Self {
        let projects = ProjectIndex::new(agent.store().kv().clone());
        Self {
            agent,
            projects,
            model,
            running: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn agent(&self) -> &AgentLoop {
        &self.agent
    }

    #[must_use]
    pub const fn projects(&self) -> &ProjectIndex {
        &self.projects
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionStore {
        self.agent.store()
    }

    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        self.agent.store().kv()
    }

    #[must_use]
    pub const fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub async fn create_project(
        &self,
        name: Option<String>,
        template: Option<String>,
    ) -> Result<Project> {
        let project = self.projects.create(name, template).await?;
        tracing::info!(project_id = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    /// Look up a project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectNotFound`] for unknown ids.
    pub async fn project(&self, project_id: &str) -> Result<Project> {
        self.projects
            .get(project_id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))
    }

    /// Load a project's session and todo log.
    pub async fn open(&self, project_id: &str) -> Result<(Session, TodoLog)> {
        self.project(project_id).await?;
        let mut session = self.sessions().load(project_id).await;
        session.set_model(self.model.clone());
        let todos = self.sessions().load_todos(&session).await;
        Ok((session, todos))
    }

    pub async fn messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let (session, _) = self.open(project_id).await?;
        Ok(session.messages().to_vec())
    }

    pub async fn todos(&self, project_id: &str) -> Result<Vec<TodoItem>> {
        let (_, todos) = self.open(project_id).await?;
        Ok(todos.items().to_vec())
    }

    /// Reasoning and tool calls, newest first.
    pub async fn activity(&self, project_id: &str) -> Result<Vec<ActivityEntry>> {
        let (session, _) = self.open(project_id).await?;
        Ok(activity(session.messages()))
    }

    /// Run one user turn on a project, publishing loop events to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TurnInProgress`] when the project already has a running turn,
    /// and the agent loop's error when the turn fails.
    pub async fn chat(&self, project_id: &str, text: &str, events: EventSink) -> Result<TurnOutcome> {
        let (mut session, mut todos) = self.open(project_id).await?;

        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.contains_key(project_id) {
                return Err(Error::TurnInProgress(project_id.to_string()));
            }
            running.insert(project_id.to_string(), cancel.clone());
        }
        let _turn = RunningTurn {
            running: &self.running,
            project_id: project_id.to_string(),
        };

        let agent = self.agent.clone().with_events(events);
        let outcome = agent.run_turn(&mut session, &mut todos, text, &cancel).await;

        if let Err(e) = self.projects.touch(project_id).await {
            tracing::warn!(project_id = %project_id, error = %e, "failed to update project timestamp");
        }

        outcome.map_err(Error::from)
    }

    /// Cancel the project's running turn. Returns whether one was running.
    pub fn cancel(&self, project_id: &str) -> bool {
        match self.running.lock().get(project_id) {
            Some(token) => {
                tracing::info!(project_id = %project_id, "cancelling turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_running(&self, project_id: &str) -> bool {
        self.running.lock().contains_key(project_id)
    }

    /// Drop the transcript and roadmap. The project stays in the index.
    pub async fn clear_session(&self, project_id: &str) -> Result<()> {
        self.project(project_id).await?;
        self.sessions().clear(project_id).await?;
        tracing::info!(project_id = %project_id, "session cleared");
        Ok(())
    }

    /// Remove a project and its session.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        if !self.projects.remove(project_id).await? {
            return Err(Error::ProjectNotFound(project_id.to_string()));
        }
        self.sessions().clear(project_id).await?;
        Ok(())
    }

    /// Tear down the backend connection and boot it again for `project_id`.
    pub async fn restart_backend(&self, project_id: &str) -> Result<ConnectionStatus> {
        let backends = self.agent.tools().backends();
        if let Err(e) = backends.restart(project_id).await {
            tracing::warn!(project_id = %project_id, error = %e, "backend restart failed");
        }
        Ok(backends.status().await)
    }

    pub async fn backend_status(&self) -> ConnectionStatus {
        self.agent.tools().backends().status().await
    }

    /// Create a repository and push the project's sandbox files to its default branch.
    pub async fn push_to_github(
        &self,
        project_id: &str,
        client: &GitHubClient,
        repo_name: &str,
        private: bool,
    ) -> Result<(Repository, PushResult)> {
        let project = self.project(project_id).await?;
        let backend = self.agent.tools().backends().backend(project_id).await?;
        let files = github::collect_backend_files(backend.as_ref()).await?;

        let repo = client
            .create_repository(repo_name, &format!("{} (built with Onyx)", project.name), private)
            .await?;
        let branch = repo.default_branch.clone().unwrap_or_else(|| "main".to_string());
        let pushed = client
            .push_files(&repo.owner.login, &repo.name, &branch, &files)
            .await?;
        Ok((repo, pushed))
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("agent", &self.agent)
            .field("running", &self.running.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::agent::{ScriptedProvider, ScriptedResponse, ToolRegistry, TurnStop};
    use crate::core::backend::{ConnectionManager, LocalConnector};
    use crate::core::kv::MemoryKv;

    fn workspace(provider: ScriptedProvider, root: &std::path::Path) -> Workspace {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let backends = Arc::new(ConnectionManager::new(Arc::new(LocalConnector::new(
            root.to_path_buf(),
            false,
        ))));
        let tools = Arc::new(ToolRegistry::new(backends, kv.clone()));
        let agent = AgentLoop::new(Arc::new(provider), tools, SessionStore::new(kv));
        Workspace::new(agent, ModelConfig::default())
    }

    #[tokio::test]
    async fn chat_requires_a_known_project() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(ScriptedProvider::new(Vec::new()), dir.path());
        let err = ws.chat("missing", "hi", EventSink::disabled()).await.unwrap_err();
        assert!(matches!(err, Error::ProjectNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn chat_persists_and_touches_project() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(
            ScriptedProvider::new([ScriptedResponse::text("Hello!")]),
            dir.path(),
        );
        let project = ws.create_project(Some("Demo".to_string()), None).await.unwrap();

        let outcome = ws.chat(&project.id, "hi", EventSink::disabled()).await.unwrap();
        assert_eq!(outcome.stop, TurnStop::Completed);
        assert_eq!(ws.messages(&project.id).await.unwrap().len(), 2);
        assert!(!ws.is_running(&project.id));

        let touched = ws.project(&project.id).await.unwrap();
        assert!(touched.updated_at >= project.updated_at);
    }

    #[tokio::test]
    async fn concurrent_turns_are_rejected_and_cancel_stops_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Arc::new(workspace(
            ScriptedProvider::new([
                ScriptedResponse::text("slow").with_delay(Duration::from_secs(30)),
            ]),
            dir.path(),
        ));
        let project = ws.create_project(None, None).await.unwrap();

        let first = {
            let ws = ws.clone();
            let id = project.id.clone();
            tokio::spawn(async move { ws.chat(&id, "one", EventSink::disabled()).await })
        };
        while !ws.is_running(&project.id) {
            tokio::task::yield_now().await;
        }

        let second = ws.chat(&project.id, "two", EventSink::disabled()).await;
        assert!(matches!(second, Err(Error::TurnInProgress(_))));

        assert!(ws.cancel(&project.id));
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.stop, TurnStop::Cancelled);
        assert!(!ws.cancel(&project.id));
    }

    #[tokio::test]
    async fn clear_keeps_project_but_drops_messages() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(ScriptedProvider::new([ScriptedResponse::text("ok")]), dir.path());
        let project = ws.create_project(None, None).await.unwrap();
        ws.chat(&project.id, "hi", EventSink::disabled()).await.unwrap();

        ws.clear_session(&project.id).await.unwrap();
        assert!(ws.messages(&project.id).await.unwrap().is_empty());
        assert!(ws.project(&project.id).await.is_ok());

        ws.delete_project(&project.id).await.unwrap();
        assert!(matches!(
            ws.project(&project.id).await,
            Err(Error::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restart_reports_connection_status() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(ScriptedProvider::new(Vec::new()), dir.path());
        let status = ws.restart_backend("demo").await.unwrap();
        assert!(matches!(status, ConnectionStatus::Connected { project_id, .. } if project_id == "demo"));
    }
}
