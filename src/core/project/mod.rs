//! Project index kept in the KV store under `onyx_projects`.

use std::sync::Arc;

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::kv::{self, KvError, KvStore, PROJECTS_KEY};
use crate::core::session::now_ms;

const ADJECTIVES: &[&str] = &[
    "Ethereal", "Quantum", "Nebula", "Glitch", "Cyber", "Lumina", "Zenith", "Phantom", "Aura",
    "Velocity", "Hyper", "Sonic", "Omega", "Prism", "Flux", "Solar", "Void", "Titan", "Neon",
    "Cosmic", "Pulse", "Cipher", "Logic", "Dynamic", "Stable",
];

const NOUNS: &[&str] = &[
    "Architect", "Engine", "Node", "Nexus", "Protocol", "Matrix", "System", "Core", "Vision",
    "Grid", "Vertex", "Sphere", "Orbit", "Pulse", "Wave", "Signal", "Bridge", "Flow", "Sync",
    "Link", "Dash", "Stack", "Port", "Shell", "Module",
];

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 8;

/// `"<Adjective> <Noun> <NNN>"`, e.g. `"Quantum Nexus 042"`.
#[must_use]
pub fn random_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Stable");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Core");
    let suffix: u32 = rng.random_range(0..1000);
    format!("{adjective} {noun} {suffix:03}")
}

/// Short lowercase alphanumeric project id.
#[must_use]
pub fn new_project_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())]))
        .collect()
}

/// Project metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Starter template the project was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Ms since epoch.
    #[serde(default)]
    pub created_at: i64,
    /// Ms since epoch.
    #[serde(default)]
    pub updated_at: i64,
}

impl Project {
    /// New project with a fresh id; a missing name gets a random one.
    #[must_use]
    pub fn new(name: Option<String>, template: Option<String>) -> Self {
        let now = now_ms();
        Self {
            id: new_project_id(),
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(random_name),
            template,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lists and edits the project index.
///
/// Every edit is a read-modify-write of one KV value; clones share the lock that
/// serializes them.
#[derive(Clone)]
pub struct ProjectIndex {
    kv: Arc<dyn KvStore>,
    writes: Arc<Mutex<()>>,
}

impl ProjectIndex {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// All projects, most recently updated first.
    ///
    /// A malformed index reads as empty.
    pub async fn list(&self) -> Result<Vec<Project>, KvError> {
        let mut projects = match kv::get_json::<Vec<Project>>(self.kv.as_ref(), PROJECTS_KEY).await {
            Ok(projects) => projects.unwrap_or_default(),
            Err(KvError::Serialization(e)) => {
                tracing::warn!(error = %e, "project index is malformed, ignoring it");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>, KvError> {
        Ok(self.list().await?.into_iter().find(|p| p.id == id))
    }

    /// Insert or merge a project.
    ///
    /// An existing entry keeps its `created_at`; `updated_at` is always refreshed.
    pub async fn upsert(&self, project: Project) -> Result<Project, KvError> {
        let _guard = self.writes.lock().await;
        self.upsert_locked(project).await
    }

    async fn upsert_locked(&self, project: Project) -> Result<Project, KvError> {
        let mut projects = self.list().await?;
        let now = now_ms();
        let saved = match projects.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => {
                existing.name = project.name;
                if project.template.is_some() {
                    existing.template = project.template;
                }
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let created = Project {
                    created_at: if project.created_at > 0 { project.created_at } else { now },
                    updated_at: now,
                    ..project
                };
                projects.push(created.clone());
                created
            }
        };
        kv::set_json(self.kv.as_ref(), PROJECTS_KEY, &projects).await?;
        tracing::debug!(project_id = %saved.id, "project saved");
        Ok(saved)
    }

    /// Create and store a new project.
    pub async fn create(&self, name: Option<String>, template: Option<String>) -> Result<Project, KvError> {
        self.upsert(Project::new(name, template)).await
    }

    /// Bump `updated_at`, e.g. after a turn. Unknown ids are ignored.
    pub async fn touch(&self, id: &str) -> Result<(), KvError> {
        let _guard = self.writes.lock().await;
        if let Some(project) = self.get(id).await? {
            self.upsert_locked(project).await?;
        }
        Ok(())
    }

    /// Remove a project from the index, returning whether it was present.
    pub async fn remove(&self, id: &str) -> Result<bool, KvError> {
        let _guard = self.writes.lock().await;
        let mut projects = self.list().await?;
        let before = projects.len();
        projects.retain(|p| p.id != id);
        if projects.len() == before {
            return Ok(false);
        }
        kv::set_json(self.kv.as_ref(), PROJECTS_KEY, &projects).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for ProjectIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectIndex").finish_non_exhaustive()
    }
}
