use crate::config::FetchConfig;
use crate::http::build_client;
use crate::models::ProductKey;
use reqwest::Client;
use std::{future::Future, path::PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image request failed: {0}")]
    Request(String),
    #[error("image request returned HTTP {0}")]
    Status(u16),
    #[error("unable to write image: {0}")]
    Io(#[from] std::io::Error),
}

/// Persists a product image and reports where it ended up.
pub trait ImageStore: Send + Sync {
    fn store(
        &self,
        key: &ProductKey,
        image_url: &str,
    ) -> impl Future<Output = Result<String, ImageError>> + Send;
}

pub struct FsImageStore {
    http: Client,
    dir: PathBuf,
}

impl FsImageStore {
    pub fn new(dir: impl Into<PathBuf>, fetch: &FetchConfig) -> Result<Self, ImageError> {
        let http = build_client(fetch, None).map_err(|err| ImageError::Request(err.to_string()))?;
        Ok(Self {
            http,
            dir: dir.into(),
        })
    }

    fn path_for(&self, key: &ProductKey) -> PathBuf {
        self.dir.join(format!("{}.jpg", key.file_stem()))
    }
}

impl ImageStore for FsImageStore {
    async fn store(&self, key: &ProductKey, image_url: &str) -> Result<String, ImageError> {
        let response = self
            .http
            .get(image_url)
            .send()
            .await
            .map_err(|err| ImageError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ImageError::Status(response.status().as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ImageError::Request(err.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        tokio::fs::write(&path, &bytes).await?;
        debug!(
            target = "catalog.images",
            key = %key,
            path = %path.display(),
            bytes = bytes.len(),
            "image stored"
        );
        Ok(path.to_string_lossy().into_owned())
    }
}
