use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{stream, stream::BoxStream, StreamExt, TryStreamExt};
use std::{io, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Byte stream of a stored object.
pub type ObjectStream = BoxStream<'static, Result<Bytes, io::Error>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object storage request failed: {0}")]
    Backend(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::StorageError(err.to_string())
    }
}

/// Read access to purchasable archives, addressed by path.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn open(&self, path: &str) -> Result<ObjectStream, StorageError>;
}

/// Supabase-compatible storage API.
#[derive(Clone)]
pub struct HttpObjectStorage {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    service_key: String,
}

impl HttpObjectStorage {
    pub fn new(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        service_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            service_key: service_key.into(),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Option<Self> {
        let url = config.storage_url.as_deref().filter(|u| !u.is_empty())?;
        let key = config.storage_service_key.as_deref().filter(|k| !k.is_empty())?;
        Some(Self::new(url, config.storage_bucket.clone(), key))
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn open(&self, path: &str) -> Result<ObjectStream, StorageError> {
        let response = self
            .client
            .get(self.object_url(path))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), %path, "Object storage rejected download");
            return Err(StorageError::Backend(format!("status {}", status)));
        }

        debug!(%path, "Streaming object from storage");
        Ok(response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed())
    }
}

/// Objects held in memory, for tests and local development.
#[derive(Clone, Default)]
pub struct InMemoryObjectStorage {
    objects: Arc<DashMap<String, Bytes>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.insert(path.into(), data.into());
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn open(&self, path: &str) -> Result<ObjectStream, StorageError> {
        let data = self
            .objects
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(stream::once(async move { Ok::<_, io::Error>(data) }).boxed())
    }
}
