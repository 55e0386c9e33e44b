//! Local filesystem object storage.
//!
//! Each container is a directory under the root; objects are files in it.
//! Used for development, tests and deployments that back up to a mounted
//! volume.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::ObjectStorage;

/// Write bytes atomically (write to temp, then rename).
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root_dir: PathBuf,
}

impl LocalObjectStorage {
    /// Create a new storage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        validate_name(container)?;
        Ok(self.root_dir.join(container))
    }

    fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.container_dir(container)?.join(name))
    }
}

/// Names map to single path components.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(AppError::object_storage(format!(
            "invalid object storage name '{name}'"
        )));
    }
    Ok(())
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn ensure_container(&self, container: &str) -> Result<bool> {
        let dir = self.container_dir(container)?;
        if tokio::fs::try_exists(&dir).await? {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(true)
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool> {
        let path = self.object_path(container, name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn upload(
        &self,
        container: &str,
        name: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        let path = self.object_path(container, name)?;
        write_atomic(&path, &bytes).await?;
        log::debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(())
    }
}
