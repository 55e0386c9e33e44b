//! AWS S3 object storage.
//!
//! A container is a bucket; archive files are stored under their file name
//! as the object key. Works against S3-compatible services when an
//! `endpoint_url` is configured.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::ProvideCredentials;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::{AppError, Result};
use crate::storage::ObjectStorage;

/// S3-backed object storage.
pub struct S3ObjectStorage {
    client: Client,
}

impl S3ObjectStorage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the standard AWS environment (env vars, profile,
    /// instance role). Fails with `MissingCredentials` when none resolve.
    pub async fn from_env(endpoint_url: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let sdk_config = loader.load().await;

        let provider = sdk_config
            .credentials_provider()
            .ok_or_else(|| AppError::missing_credentials("no AWS credentials provider"))?;
        provider
            .provide_credentials()
            .await
            .map_err(|e| AppError::missing_credentials(e.to_string()))?;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if endpoint_url.is_some() {
            builder = builder.force_path_style(true);
        }
        Ok(Self::new(Client::from_conf(builder.build())))
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn ensure_container(&self, container: &str) -> Result<bool> {
        if self
            .client
            .head_bucket()
            .bucket(container)
            .send()
            .await
            .is_ok()
        {
            return Ok(false);
        }

        self.client
            .create_bucket()
            .bucket(container)
            .send()
            .await
            .map_err(|e| AppError::object_storage(e.into_service_error()))?;
        log::info!("Created bucket s3://{}", container);
        Ok(true)
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(container)
            .key(name)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(AppError::object_storage(service_err))
                }
            }
        }
    }

    async fn upload(
        &self,
        container: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(container)
            .key(name)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| AppError::object_storage(e.into_service_error()))?;

        log::info!("Wrote {} bytes to s3://{}/{}", size, container, name);
        Ok(())
    }
}
