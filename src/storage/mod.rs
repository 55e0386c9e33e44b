//! Object storage gateway for archive files.
//!
//! The archiver only needs three things from a backend: make sure a
//! container exists, check whether an object is already there, and store
//! bytes under a name. Backends:
//!
//! ```text
//! local   {root}/{container}/{name}      directory per container
//! s3      s3://{container}/{name}        feature "s3"
//! ```

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{StorageBackend, StorageConfig};

pub use local::{LocalObjectStorage, write_atomic};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStorage;

/// Content type of the gzip-compressed archive files.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

/// Trait for object storage backends.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create the container if it is missing. Returns whether it was created.
    async fn ensure_container(&self, container: &str) -> Result<bool>;

    /// Whether an object with this name is already stored.
    async fn exists(&self, container: &str, name: &str) -> Result<bool>;

    /// Store `bytes` under `name`, replacing any previous object.
    async fn upload(
        &self,
        container: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
}

/// Connect to the configured backend.
///
/// Fails with [`AppError::MissingCredentials`] when uploads are disabled or
/// the backend has no credentials.
pub async fn connect(config: &StorageConfig) -> Result<Box<dyn ObjectStorage>> {
    match config.backend {
        StorageBackend::None => Err(AppError::missing_credentials(
            "no object storage backend configured",
        )),
        StorageBackend::Local => Ok(Box::new(LocalObjectStorage::new(&config.local_root))),
        StorageBackend::S3 => connect_s3(config).await,
    }
}

#[cfg(feature = "s3")]
async fn connect_s3(config: &StorageConfig) -> Result<Box<dyn ObjectStorage>> {
    Ok(Box::new(
        S3ObjectStorage::from_env(config.endpoint_url.as_deref()).await?,
    ))
}

#[cfg(not(feature = "s3"))]
async fn connect_s3(_config: &StorageConfig) -> Result<Box<dyn ObjectStorage>> {
    Err(AppError::config(
        "the s3 storage backend requires building with the `s3` feature",
    ))
}
