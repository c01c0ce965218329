use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("log `{0}` not found")]
    NotFound(String),
    #[error("invalid log path `{0}`")]
    InvalidPath(String),
    #[error("log storage io error on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Byte storage for task logs. Every write replaces the whole value.
#[async_trait]
pub trait LogStorage: Send + Sync {
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), LogStoreError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, LogStoreError>;
}

/// One file per log path under `root`.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    root: PathBuf,
}

impl FileLogStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, LogStoreError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(LogStoreError::InvalidPath(path.to_string()));
        }
        let relative = Path::new(trimmed);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(LogStoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &str, source: std::io::Error) -> LogStoreError {
    LogStoreError::Io {
        path: path.to_string(),
        source,
    }
}

#[async_trait]
impl LogStorage for FileLogStore {
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), LogStoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(path, err))?;
        }
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LogStoreError::InvalidPath(path.to_string()))?;
        let tmp = target.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, content)
            .await
            .map_err(|err| io_error(path, err))?;
        if let Err(err) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(path, err));
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, LogStoreError> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(LogStoreError::NotFound(path.to_string()))
            }
            Err(err) => Err(io_error(path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_write_of_same_content_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::new(dir.path());
        for _ in 0..2 {
            store
                .write("logs/tpl-1/run-2", b"init\nplan ok")
                .await
                .expect("write");
        }
        let bytes = store.read("logs/tpl-1/run-2").await.expect("read");
        assert_eq!(bytes, b"init\nplan ok");
        let leftovers = std::fs::read_dir(dir.path().join("logs/tpl-1"))
            .expect("dir")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn write_replaces_previous_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::new(dir.path());
        store
            .write("logs/tpl-1/run-1", b"first\nsecond")
            .await
            .expect("write");
        store
            .write("logs/tpl-1/run-1", b"first\nsecond\nthird")
            .await
            .expect("rewrite");
        let bytes = store.read("logs/tpl-1/run-1").await.expect("read");
        assert_eq!(bytes, b"first\nsecond\nthird");
        assert!(dir.path().join("logs/tpl-1/run-1").is_file());
    }

    #[tokio::test]
    async fn missing_log_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::new(dir.path());
        assert!(matches!(
            store.read("logs/tpl-1/absent").await,
            Err(LogStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::new(dir.path());
        for bad in ["../outside", "/etc/passwd", "logs/../../x", "  "] {
            assert!(
                matches!(
                    store.write(bad, b"x").await,
                    Err(LogStoreError::InvalidPath(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLogStore::new(dir.path());
        store.write("logs/t/r", b"abc").await.expect("write");
        let entries = std::fs::read_dir(dir.path().join("logs/t"))
            .expect("dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec!["r".to_string()]);
    }
}
