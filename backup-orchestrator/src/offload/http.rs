//! REST object store: `PUT`/`GET`/`HEAD {base}/{key}` and
//! `GET {base}?prefix=...` returning a JSON array of `{key, size}`.

use super::progress::ProgressStream;
use super::{ObjectInfo, ObjectStore};
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{RequestBuilder, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_file(&self, key: &str, src: &Path) -> Result<()> {
        let file = tokio::fs::File::open(src).await?;
        let size = file.metadata().await?.len();

        let progress_key = key.to_string();
        let stream = ProgressStream::new(
            ReaderStream::new(file),
            Arc::new(move |sent| debug!(key = %progress_key, sent, total = size, "Upload progress")),
        );

        self.authorize(self.client.put(self.url(key)))
            .header(CONTENT_LENGTH, size)
            .header("content-type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let response = self.authorize(self.client.get(self.url(key))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(OrchestratorError::NotFound(format!("object {} does not exist", key)));
        }
        let response = response.error_for_status()?;

        let mut partial = dest.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, dest).await?;
        Ok(written)
    }

    async fn stat(&self, key: &str) -> Result<Option<u64>> {
        let response = self.authorize(self.client.head(self.url(key))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        // HEAD has no body, so read the header rather than the body size hint.
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                OrchestratorError::TransientIo(format!("HEAD {} returned no content-length", key))
            })?;
        Ok(Some(size))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let objects = self
            .authorize(self.client.get(&self.base_url).query(&[("prefix", prefix)]))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<ObjectInfo>>()
            .await?;
        Ok(objects)
    }
}
