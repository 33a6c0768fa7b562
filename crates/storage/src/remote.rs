//! Object-store seam
//!
//! Dual-write mirrors recordings to a remote object store; the local copy
//! stays authoritative. The HTTP implementation PUTs blobs under their
//! relative path.

use async_trait::async_trait;
use reqwest::Client;

use crate::StorageError;

/// A remote blob store addressed by relative path
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// HTTP object store (PUT/GET/DELETE under a base URL)
pub struct HttpBlobStore {
    client: Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let response = self
            .client
            .put(self.url(path))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| StorageError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Remote(format!(
                "put {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| StorageError::Remote(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Err(StorageError::NotFound);
        }
        if !response.status().is_success() {
            return Err(StorageError::Remote(format!(
                "get {} returned {}",
                path,
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StorageError::Remote(e.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .map_err(|e| StorageError::Remote(e.to_string()))?;

        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(StorageError::Remote(format!(
                "delete {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(())
    }
}
