//! Object store over a local directory tree
//!
//! Each container is a directory under the configured root; object names are
//! `/`-separated paths relative to it.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::storage::{
    error::{StorageError, StorageResult},
    traits::ObjectStore,
};

/// Local filesystem object store
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> StorageResult<PathBuf> {
        let relative = relative_path(container).ok_or_else(|| {
            StorageError::configuration(format!("Container escapes the root: {}", container))
        })?;
        Ok(self.root.join(relative))
    }
}

/// `name` as a path inside its parent, or `None` if it is empty or would escape
fn relative_path(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let mut components = path.components().peekable();
    components.peek()?;
    components
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| path.to_path_buf())
}

fn map_io(err: std::io::Error, what: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::not_found(what)
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn list(&self, container: &str) -> StorageResult<Vec<String>> {
        let dir = self.container_dir(container)?;

        let names = tokio::task::spawn_blocking(move || -> StorageResult<Vec<String>> {
            if !dir.is_dir() {
                return Err(StorageError::not_found(dir.display()));
            }

            let mut names = Vec::new();
            for entry in WalkDir::new(&dir).follow_links(true) {
                let entry = entry.map_err(|e| StorageError::backend(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(&dir) {
                    let name = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
        .await
        .map_err(|e| StorageError::backend(format!("Listing task failed: {}", e)))??;

        debug!(container, count = names.len(), "Listed objects");
        Ok(names)
    }

    async fn read(&self, container: &str, name: &str) -> StorageResult<Vec<u8>> {
        let relative = relative_path(name).ok_or_else(|| StorageError::invalid_name(name))?;
        let path = self.container_dir(container)?.join(relative);
        tokio::fs::read(&path)
            .await
            .map_err(|e| map_io(e, &format!("{}/{}", container, name)))
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
