//! Local sandbox: one directory per project, commands run as child processes.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::{
    BackendConnector, BackendError, BackendKind, CommandEvent, CommandStream, DirEntry,
    ExecutionBackend, Result, Utf8Decoder, sort_entries,
};

const READ_CHUNK: usize = 4096;

/// Boots [`LocalSandbox`]es under a shared root.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
    require_node: bool,
}

impl LocalConnector {
    /// Create a connector rooted at `root`.
    ///
    /// With `require_node` set, boot fails unless a `node` binary is on `PATH`.
    #[must_use]
    pub const fn new(root: PathBuf, require_node: bool) -> Self {
        Self { root, require_node }
    }
}

#[async_trait]
impl BackendConnector for LocalConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn connect(&self, project_id: &str) -> Result<Arc<dyn ExecutionBackend>> {
        if project_id.is_empty()
            || project_id.contains(['/', '\\'])
            || project_id == "."
            || project_id == ".."
        {
            return Err(BackendError::Unavailable(format!(
                "invalid project id: {project_id:?}"
            )));
        }

        if self.require_node {
            which::which("node").map_err(|_| {
                BackendError::Unavailable("node runtime not found on PATH".to_string())
            })?;
        }

        let dir = self.root.join(project_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", dir.display())))?;

        tracing::debug!(dir = %dir.display(), "local sandbox ready");
        Ok(Arc::new(LocalSandbox::new(dir)))
    }
}

/// A project directory acting as the sandbox filesystem.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    dir: PathBuf,
}

impl LocalSandbox {
    /// Wrap an existing project directory.
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Project directory on disk.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a sandbox path onto the project directory.
    ///
    /// Absolute paths are taken relative to the project root; `..` is rejected.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.dir.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(BackendError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(resolved)
    }
}

fn not_found_or(path: &str, e: std::io::Error) -> BackendError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackendError::NotFound(path.to_string())
    } else {
        BackendError::Io(e)
    }
}

#[async_trait]
impl ExecutionBackend for LocalSandbox {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if target == self.dir {
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|e| not_found_or(path, e))
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let target = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&target)
            .await
            .map_err(|e| not_found_or(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn run_command(&self, command: &str, args: &[String]) -> Result<CommandStream> {
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| not_found_or(command, e))?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(BackendError::Protocol(
                "child process pipes unavailable".to_string(),
            ));
        };

        tracing::debug!(command = %command, args = ?args, "spawned command");

        let stream = async_stream::stream! {
            let mut out_buf = [0_u8; READ_CHUNK];
            let mut err_buf = [0_u8; READ_CHUNK];
            let mut out_text = Utf8Decoder::new();
            let mut err_text = Utf8Decoder::new();
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                let chunk = tokio::select! {
                    read = stdout.read(&mut out_buf), if out_open => match read {
                        Ok(n) if n > 0 => out_text.push(&out_buf[..n]),
                        _ => {
                            out_open = false;
                            out_text.finish()
                        }
                    },
                    read = stderr.read(&mut err_buf), if err_open => match read {
                        Ok(n) if n > 0 => err_text.push(&err_buf[..n]),
                        _ => {
                            err_open = false;
                            err_text.finish()
                        }
                    },
                };
                if !chunk.is_empty() {
                    yield Ok(CommandEvent::Output(chunk));
                }
            }

            match child.wait().await {
                Ok(status) => yield Ok(CommandEvent::Exit(status.code().unwrap_or(-1))),
                Err(e) => yield Err(BackendError::Io(e)),
            }
        };

        Ok(CommandStream::new(stream))
    }

    fn preview_url(&self, port: u16) -> String {
        format!("http://localhost:{port}")
    }
}
