//! Key-value persistence for sessions, todo logs, tokens, and project metadata.
//!
//! Every persisted shape in Onyx goes through a [`KvStore`]: a flat string-to-string
//! map with `get`, `set`, `del`, and `list`. Values are JSON documents encoded by the
//! caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::Config;

/// Key holding the project index.
pub const PROJECTS_KEY: &str = "onyx_projects";

/// Key holding the GitHub personal access token.
pub const GITHUB_TOKEN_KEY: &str = "github_token";

/// Key holding the worker deployment registry.
pub const WORKERS_KEY: &str = "onyx_workers";

/// Key holding the persisted transcript for a project.
#[must_use]
pub fn session_key(project_id: &str) -> String {
    format!("project_{project_id}")
}

/// Key holding the todo event log for a project.
#[must_use]
pub fn todos_key(project_id: &str) -> String {
    format!("todos_{project_id}")
}

/// Key holding the remote sandbox id bound to a project.
#[must_use]
pub fn sandbox_id_key(project_id: &str) -> String {
    format!("csb_sandbox_id_{project_id}")
}

/// KV errors.
#[derive(Debug, Error)]
pub enum KvError {
    /// Key is empty.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// KV result type.
pub type Result<T> = std::result::Result<T, KvError>;

/// External key-value store contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Absent keys yield `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing an absent key is not an error.
    async fn del(&self, key: &str) -> Result<()>;

    /// List every stored key, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Read and decode a JSON value.
///
/// # Errors
///
/// Returns error if the read fails or the stored value does not parse as `T`.
pub async fn get_json<T>(kv: &dyn KvStore, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    match kv.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
///
/// # Errors
///
/// Returns error if encoding or the write fails.
pub async fn set_json<T>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()>
where
    T: Serialize + Sync + ?Sized,
{
    let json = serde_json::to_string(value)?;
    kv.set(key, &json).await
}

/// Longest key accepted. Hex file names double it and must stay under `NAME_MAX`
/// together with the temp-file suffix.
pub const MAX_KEY_LEN: usize = 110;

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(KvError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Filesystem-backed store: one file per key under a root directory.
///
/// File names are the hex encoding of the key so arbitrary keys map to safe names.
#[derive(Debug, Clone)]
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    /// Create a store at the default location (`<data dir>/kv`).
    ///
    /// # Errors
    ///
    /// Returns error if data directory cannot be determined.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::with_root(Config::data_dir()?.join("kv")))
    }

    /// Create a store at a custom location.
    #[must_use]
    pub const fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the store root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.kv", hex::encode(key)))
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        check_key(key)?;
        tokio::fs::create_dir_all(&self.root).await?;

        // Write to a uniquely named sibling then rename so readers never see a torn
        // value and concurrent writers of one key never share a temp file
        let path = self.path(key);
        let tmp = path.with_extension(format!("kv.{}.tmp", ulid::Ulid::new()));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::trace!(key = %key, bytes = value.len(), "kv set");
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        check_key(key)?;
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "kv") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(bytes) = hex::decode(stem) else {
                continue;
            };
            if let Ok(key) = String::from_utf8(bytes) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        check_key(key)?;
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        id: String,
        value: i32,
    }

    fn temp_kv() -> (FileKv, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::with_root(dir.path().join("kv"));
        (kv, dir)
    }

    #[tokio::test]
    async fn set_and_get() {
        let (kv, _dir) = temp_kv();
        kv.set("project_abc", "[1,2,3]").await.unwrap();
        assert_eq!(kv.get("project_abc").await.unwrap().as_deref(), Some("[1,2,3]"));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let (kv, _dir) = temp_kv();
        assert!(kv.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn del_is_idempotent() {
        let (kv, _dir) = temp_kv();
        kv.set("k", "v").await.unwrap();
        kv.del("k").await.unwrap();
        kv.del("k").await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_decodes_keys() {
        let (kv, _dir) = temp_kv();
        kv.set("project_b", "1").await.unwrap();
        kv.set("github_token", "2").await.unwrap();
        kv.set("csb_sandbox_id_a/b", "3").await.unwrap();

        let keys = kv.list().await.unwrap();
        assert_eq!(keys, vec!["csb_sandbox_id_a/b", "github_token", "project_b"]);
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let (kv, _dir) = temp_kv();
        assert!(kv.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let kv = MemoryKv::new();
        assert!(matches!(kv.set("", "v").await, Err(KvError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn overlong_key_is_rejected_before_touching_disk() {
        let (kv, dir) = temp_kv();
        let longest = "k".repeat(MAX_KEY_LEN);
        kv.set(&longest, "v").await.unwrap();
        assert_eq!(kv.get(&longest).await.unwrap().as_deref(), Some("v"));

        let too_long = format!("app_abcdefgh_{}", "k".repeat(MAX_KEY_LEN));
        assert!(matches!(
            kv.set(&too_long, "v").await,
            Err(KvError::InvalidKey(_))
        ));
        assert!(matches!(kv.get(&too_long).await, Err(KvError::InvalidKey(_))));
        assert_eq!(std::fs::read_dir(dir.path().join("kv")).unwrap().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sets_on_one_key_all_succeed() {
        let (kv, _dir) = temp_kv();
        let writers: Vec<_> = (0..20)
            .map(|i| {
                let kv = kv.clone();
                tokio::spawn(async move { kv.set("shared", &i.to_string()).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let value: u32 = kv.get("shared").await.unwrap().unwrap().parse().unwrap();
        assert!(value < 20);
        assert_eq!(kv.list().await.unwrap(), vec!["shared"]);
    }

    #[tokio::test]
    async fn json_helpers_roundtrip() {
        let kv = MemoryKv::new();
        let data = TestData {
            id: "test".to_string(),
            value: 42,
        };
        set_json(&kv, "data", &data).await.unwrap();
        let read: Option<TestData> = get_json(&kv, "data").await.unwrap();
        assert_eq!(read, Some(data));
    }

    #[tokio::test]
    async fn get_json_reports_malformed_value() {
        let kv = MemoryKv::new();
        kv.set("data", "{not json").await.unwrap();
        let read: Result<Option<TestData>> = get_json(&kv, "data").await;
        assert!(matches!(read, Err(KvError::Serialization(_))));
    }

    #[test]
    fn well_known_keys() {
        assert_eq!(session_key("p1"), "project_p1");
        assert_eq!(todos_key("p1"), "todos_p1");
        assert_eq!(sandbox_id_key("p1"), "csb_sandbox_id_p1");
    }
}
