//! Serverless worker deployments behind the `cloud_worker_op` tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::kv::{self, KvError, KvStore, WORKERS_KEY};

/// Worker provider errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Name is empty or contains characters that cannot appear in a host name.
    #[error("invalid worker name '{0}': use lowercase letters, digits and dashes")]
    InvalidName(String),

    #[error("worker not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// A deployed worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WorkerInfo {
    pub name: String,
    pub url: String,
    /// Ms since epoch.
    pub created_at: i64,
}

/// Deploys and tracks workers.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    /// Every deployed worker, ordered by name.
    async fn list(&self) -> Result<Vec<WorkerInfo>, WorkerError>;

    /// Deploy `code` as `name`, replacing any worker with the same name.
    async fn create(&self, name: &str, code: &str) -> Result<WorkerInfo, WorkerError>;

    /// Remove the worker called `name`.
    async fn delete(&self, name: &str) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerRecord {
    #[serde(flatten)]
    info: WorkerInfo,
    code: String,
}

/// Worker registry kept in the KV store under [`WORKERS_KEY`].
pub struct KvWorkerRegistry {
    kv: Arc<dyn KvStore>,
    domain: String,
    /// Held across each read-modify-write of the worker list.
    writes: Mutex<()>,
}

impl KvWorkerRegistry {
    /// Registry reporting `https://<name>.puter.work` URLs.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_domain(kv, "puter.work")
    }

    #[must_use]
    pub fn with_domain(kv: Arc<dyn KvStore>, domain: impl Into<String>) -> Self {
        Self {
            kv,
            domain: domain.into(),
            writes: Mutex::new(()),
        }
    }

    async fn records(&self) -> Result<Vec<WorkerRecord>, WorkerError> {
        Ok(kv::get_json::<Vec<WorkerRecord>>(self.kv.as_ref(), WORKERS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, records: &[WorkerRecord]) -> Result<(), WorkerError> {
        kv::set_json(self.kv.as_ref(), WORKERS_KEY, records).await?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), WorkerError> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(WorkerError::InvalidName(name.to_string()))
    }
}

#[async_trait]
impl WorkerProvider for KvWorkerRegistry {
    async fn list(&self) -> Result<Vec<WorkerInfo>, WorkerError> {
        let mut workers: Vec<WorkerInfo> = self.records().await?.into_iter().map(|r| r.info).collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn create(&self, name: &str, code: &str) -> Result<WorkerInfo, WorkerError> {
        validate_name(name)?;

        let info = WorkerInfo {
            name: name.to_string(),
            url: format!("https://{name}.{}", self.domain),
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        let _guard = self.writes.lock().await;
        let mut records = self.records().await?;
        records.retain(|r| r.info.name != name);
        records.push(WorkerRecord {
            info: info.clone(),
            code: code.to_string(),
        });
        self.save(&records).await?;

        tracing::info!(worker = %name, url = %info.url, "worker deployed");
        Ok(info)
    }

    async fn delete(&self, name: &str) -> Result<(), WorkerError> {
        let _guard = self.writes.lock().await;
        let mut records = self.records().await?;
        let before = records.len();
        records.retain(|r| r.info.name != name);
        if records.len() == before {
            return Err(WorkerError::NotFound(name.to_string()));
        }
        self.save(&records).await?;
        tracing::info!(worker = %name, "worker deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv::{FileKv, MemoryKv};

    fn registry() -> KvWorkerRegistry {
        KvWorkerRegistry::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn create_list_delete() {
        let workers = registry();
        let info = workers.create("hello", "puter.ai.chat('hi')").await.unwrap();
        assert_eq!(info.url, "https://hello.puter.work");

        workers.create("api", "// api").await.unwrap();
        let names: Vec<_> = workers.list().await.unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["api", "hello"]);

        workers.delete("hello").await.unwrap();
        assert_eq!(workers.list().await.unwrap().len(), 1);
        assert!(matches!(
            workers.delete("hello").await,
            Err(WorkerError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deploys_are_all_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let workers = Arc::new(KvWorkerRegistry::new(Arc::new(FileKv::with_root(
            dir.path().to_path_buf(),
        ))));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let workers = workers.clone();
                tokio::spawn(async move { workers.create(&format!("w{i}"), "// code").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(workers.list().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn create_replaces_same_name() {
        let workers = registry();
        workers.create("w", "v1").await.unwrap();
        workers.create("w", "v2").await.unwrap();
        assert_eq!(workers.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_names() {
        let workers = registry();
        for name in ["", "Upper", "has space", "-lead", "a.b"] {
            assert!(matches!(
                workers.create(name, "x").await,
                Err(WorkerError::InvalidName(_))
            ));
        }
    }
}
