//! Object storage for re-hosted outputs.
//!
//! Provider output URLs expire, so every output is copied into our bucket
//! before the work is archived.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{http_client, trim_base};

const DEFAULT_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unreachable: {0}")]
    Network(String),

    #[error("storage request failed ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<StoredObject, StorageError>;

    /// Download `source_url` and store the bytes under a new key.
    async fn rehost(&self, source_url: &str) -> Result<StoredObject, StorageError>;
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().map(str::trim) {
        Some("image/jpeg") => "jpg",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        Some("image/png") => "png",
        _ => "bin",
    }
}

fn object_key(content_type: &str) -> String {
    format!("outputs/{}.{}", Uuid::now_v7(), extension_for(content_type))
}

/// PUT-based bucket gateway: objects are written to and served from
/// `{base}/{key}`.
#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpObjectStorage {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = http_client(timeout).map_err(|e| StorageError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: trim_base(base_url),
            api_token,
        })
    }
}

#[async_trait::async_trait]
impl ObjectStorage for HttpObjectStorage {
    #[instrument(skip(self, bytes), fields(size = bytes.len()), err)]
    async fn store(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let url = format!("{}/{}", self.base_url, object_key(content_type));
        let size = bytes.len() as u64;

        let mut req = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StorageError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        debug!(%url, size, "object stored");
        Ok(StoredObject { url, size })
    }

    #[instrument(skip(self), err)]
    async fn rehost(&self, source_url: &str) -> Result<StoredObject, StorageError> {
        let resp = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StorageError::Api {
                status: status.as_u16(),
                body: format!("download of {source_url} failed"),
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;

        self.store(bytes.to_vec(), &content_type).await
    }
}

/// Dev/test storage. `rehost` does not download; it records the source URL.
#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<HashMap<String, (String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl InMemoryObjectStorage {
    pub const URL_PREFIX: &'static str = "memory://";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, url: &str) -> Option<(String, Vec<u8>)> {
        let key = url.strip_prefix(Self::URL_PREFIX)?;
        self.objects.read().ok()?.get(key).cloned()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn store(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory storage is failing".into()));
        }
        let key = object_key(content_type);
        let size = bytes.len() as u64;
        self.objects
            .write()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".into()))?
            .insert(key.clone(), (content_type.to_string(), bytes));
        Ok(StoredObject {
            url: format!("{}{key}", Self::URL_PREFIX),
            size,
        })
    }

    async fn rehost(&self, source_url: &str) -> Result<StoredObject, StorageError> {
        let content_type = match source_url.rsplit('.').next() {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("webp") => "image/webp",
            _ => DEFAULT_CONTENT_TYPE,
        };
        self.store(source_url.as_bytes().to_vec(), content_type).await
    }
}
