//! Remote sandbox reached over an authenticated HTTP API.
//!
//! The sandbox id for each project is kept in the KV store so a later process
//! reconnects to the same remote workspace instead of creating a new one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{
    BackendConnector, BackendError, BackendKind, CommandEvent, CommandStream, DirEntry,
    ExecutionBackend, Result, sort_entries,
};
use crate::core::kv::{self, KvStore};

/// Boots [`RemoteSandbox`]es against a sandbox API.
pub struct RemoteConnector {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    kv: Arc<dyn KvStore>,
}

impl RemoteConnector {
    /// Create a connector. A missing token makes every boot fail as unavailable.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            kv,
        }
    }

    async fn create_sandbox(&self, token: &str, project_id: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }

        let response = self
            .http
            .post(format!("{}/sandboxes", self.base_url))
            .bearer_auth(token)
            .json(&CreateSandbox {
                title: project_id,
                files: starter_files(),
            })
            .send()
            .await?;
        let created: Created = check(response).await?.json().await?;
        tracing::info!(project_id = %project_id, sandbox_id = %created.id, "created remote sandbox");
        Ok(created.id)
    }

    async fn resume(&self, token: &str, sandbox_id: &str) -> Result<StatusCode> {
        let response = self
            .http
            .post(format!("{}/sandboxes/{sandbox_id}/connect", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        check(response).await?;
        Ok(status)
    }
}

impl std::fmt::Debug for RemoteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnector")
            .field("base_url", &self.base_url)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BackendConnector for RemoteConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn connect(&self, project_id: &str) -> Result<Arc<dyn ExecutionBackend>> {
        let token = self.token.as_deref().ok_or_else(|| {
            BackendError::Unavailable(
                "no sandbox API token configured; run `onyx auth sandbox-token`".to_string(),
            )
        })?;

        let key = kv::sandbox_id_key(project_id);
        let stored = self
            .kv
            .get(&key)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut sandbox_id = match stored {
            Some(id) => id,
            None => self.create_sandbox(token, project_id).await?,
        };

        if self.resume(token, &sandbox_id).await? == StatusCode::NOT_FOUND {
            tracing::warn!(sandbox_id = %sandbox_id, "stored sandbox is gone, creating a new one");
            sandbox_id = self.create_sandbox(token, project_id).await?;
            check(
                self.http
                    .post(format!("{}/sandboxes/{sandbox_id}/connect", self.base_url))
                    .bearer_auth(token)
                    .send()
                    .await?,
            )
            .await?;
        }

        self.kv
            .set(&key, &sandbox_id)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        tracing::info!(project_id = %project_id, sandbox_id = %sandbox_id, "connected to remote sandbox");
        Ok(Arc::new(RemoteSandbox {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.to_string(),
            sandbox_id,
        }))
    }
}

#[derive(Serialize)]
struct CreateSandbox<'a> {
    title: &'a str,
    files: serde_json::Value,
}

/// Files every new remote sandbox starts with.
fn starter_files() -> serde_json::Value {
    serde_json::json!({
        "index.js": "console.log(\"Onyx Project Booted\");\n",
        "package.json": serde_json::to_string_pretty(&serde_json::json!({
            "name": "onyx-project",
            "main": "index.js",
            "dependencies": {
                "vite": "latest",
                "@vitejs/plugin-react": "latest",
                "react": "latest",
                "react-dom": "latest"
            }
        }))
        .unwrap_or_default(),
    })
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Protocol(format!("sandbox API returned {status}: {body}")))
}

/// One line of the newline-delimited command output protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Output { data: String },
    Exit { code: i32 },
}

fn parse_wire_line(line: &str) -> Option<Result<CommandEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<WireEvent>(line) {
        Ok(WireEvent::Output { data }) => Ok(CommandEvent::Output(data)),
        Ok(WireEvent::Exit { code }) => Ok(CommandEvent::Exit(code)),
        Err(e) => Err(BackendError::Protocol(format!("bad command event: {e}"))),
    })
}

/// A connected hosted sandbox.
#[derive(Debug, Clone)]
pub struct RemoteSandbox {
    http: reqwest::Client,
    base_url: String,
    token: String,
    sandbox_id: String,
}

impl RemoteSandbox {
    /// Remote sandbox id.
    #[must_use]
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    fn url(&self, endpoint: &str, path: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}/sandboxes/{}/{endpoint}",
            self.base_url, self.sandbox_id
        ))
        .map_err(|e| BackendError::Protocol(e.to_string()))?;
        if let Some(path) = path {
            url.query_pairs_mut().append_pair("path", path);
        }
        Ok(url)
    }
}

#[derive(Serialize)]
struct RunCommand<'a> {
    command: &'a str,
    args: &'a [String],
}

#[async_trait]
impl ExecutionBackend for RemoteSandbox {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let response = self
            .http
            .put(self.url("files", Some(path))?)
            .bearer_auth(&self.token)
            .body(contents.to_string())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let response = self
            .http
            .get(self.url("files", Some(path))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(path.to_string()));
        }
        Ok(check(response).await?.text().await?)
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let response = self
            .http
            .get(self.url("dirs", Some(path))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(path.to_string()));
        }
        let mut entries: Vec<DirEntry> = check(response).await?.json().await?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn run_command(&self, command: &str, args: &[String]) -> Result<CommandStream> {
        let response = self
            .http
            .post(self.url("commands", None)?)
            .bearer_auth(&self.token)
            .json(&RunCommand { command, args })
            .send()
            .await?;
        let byte_stream = check(response).await?.bytes_stream();

        let stream = async_stream::stream! {
            // Bytes, not text: a chunk may end inside a multi-byte character.
            let mut buffer: Vec<u8> = Vec::new();
            futures::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => buffer.extend_from_slice(&bytes),
                    Err(e) => {
                        yield Err(BackendError::Http(e));
                        return;
                    }
                }

                while let Some(end) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=end).collect();
                    if let Some(event) = parse_wire_line(&String::from_utf8_lossy(&line)) {
                        yield event;
                    }
                }
            }

            if let Some(event) = parse_wire_line(&String::from_utf8_lossy(&buffer)) {
                yield event;
            }
        };

        Ok(CommandStream::new(stream))
    }

    fn preview_url(&self, port: u16) -> String {
        format!("https://{}-{port}.csb.app", self.sandbox_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv::MemoryKv;

    #[test]
    fn wire_lines_parse() {
        assert_eq!(
            parse_wire_line(r#"{"type":"output","data":"hi"}"#).unwrap().unwrap(),
            CommandEvent::Output("hi".to_string())
        );
        assert_eq!(
            parse_wire_line(r#"{"type":"exit","code":1}"#).unwrap().unwrap(),
            CommandEvent::Exit(1)
        );
        assert!(parse_wire_line("   ").is_none());
        assert!(matches!(
            parse_wire_line("{oops").unwrap(),
            Err(BackendError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn missing_token_is_unavailable() {
        let connector = RemoteConnector::new("http://127.0.0.1:9", None, Arc::new(MemoryKv::new()));
        assert!(matches!(
            connector.connect("p1").await,
            Err(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn preview_url_uses_sandbox_host() {
        let sb = RemoteSandbox {
            http: reqwest::Client::new(),
            base_url: "http://x".to_string(),
            token: "t".to_string(),
            sandbox_id: "abc123".to_string(),
        };
        assert_eq!(sb.preview_url(5173), "https://abc123-5173.csb.app");
    }

    #[test]
    fn file_urls_encode_path() {
        let sb = RemoteSandbox {
            http: reqwest::Client::new(),
            base_url: "http://sandbox.test/v1".to_string(),
            token: "t".to_string(),
            sandbox_id: "abc".to_string(),
        };
        let url = sb.url("files", Some("src/App Main.jsx")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://sandbox.test/v1/sandboxes/abc/files?path=src%2FApp+Main.jsx"
        );
    }
}
