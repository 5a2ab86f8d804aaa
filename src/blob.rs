//! Blob download with issued storage tokens.
//!
//! [`BlobFetcher`] picks the token for a blob URI and hands the authorized
//! URL to a [`BlobTransport`]. The fetcher is built from one credential
//! bundle and replaced as a whole when the bundle rotates.

use crate::error::FetchError;
use crate::types::{BlobEndpoint, BlobNotification, CredentialBundle};
use crate::utils::normalize;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Raw blob transfer
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written
    async fn download_to(
        &self,
        url: &Url,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError>;
}

/// Plain HTTP(S) GET transport
#[derive(Clone, Debug, Default)]
pub struct HttpBlobTransport {
    client: reqwest::Client,
}

impl HttpBlobTransport {
    /// Create a transport with its own connection pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport on an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobTransport for HttpBlobTransport {
    async fn download_to(
        &self,
        url: &Url,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = self.client.get(url.clone()).send() => response?,
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(FetchError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                uri: without_query(url),
            });
        }

        let io_err = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(bytes) = chunk else { break };
            file.write_all(&bytes).await.map_err(io_err)?;
            written += bytes.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
}

/// Token-aware blob downloader
pub struct BlobFetcher {
    endpoints: Vec<BlobEndpoint>,
    transport: Arc<dyn BlobTransport>,
}

impl BlobFetcher {
    /// Build a fetcher over `endpoints`
    pub fn new(endpoints: Vec<BlobEndpoint>, transport: Arc<dyn BlobTransport>) -> Self {
        Self {
            endpoints,
            transport,
        }
    }

    /// Build a fetcher from the endpoints of `bundle`
    pub fn from_bundle(bundle: &CredentialBundle, transport: Arc<dyn BlobTransport>) -> Self {
        Self::new(bundle.blob_endpoints.clone(), transport)
    }

    /// Number of endpoints the fetcher knows about
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Find the endpoint whose base URL covers `uri`
    ///
    /// Matching is case-insensitive and stops at path-segment boundaries, so
    /// `https://a/x` covers `https://a/x/blob` but not `https://a/xy/blob`.
    /// When several bases match, the longest one wins.
    pub fn resolve(&self, uri: &Url) -> Result<&BlobEndpoint, FetchError> {
        let target = normalize(&without_query(uri));
        self.endpoints
            .iter()
            .filter_map(|endpoint| {
                let base = normalize(&endpoint.base_url);
                let base = base.trim_end_matches('/');
                let rest = target.strip_prefix(base)?;
                (rest.is_empty() || rest.starts_with('/')).then_some((base.len(), endpoint))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, endpoint)| endpoint)
            .ok_or_else(|| FetchError::NoMatchingCredential {
                uri: without_query(uri),
            })
    }

    /// URL of `uri` authorized with the matching token
    pub fn authorize(&self, uri: &Url) -> Result<Url, FetchError> {
        let endpoint = self.resolve(uri)?;
        let mut url = uri.clone();
        if endpoint.token_query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&endpoint.token_query));
        }
        Ok(url)
    }

    /// Download the blob announced by `notification` into `dest`
    pub async fn download(
        &self,
        notification: &BlobNotification,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let url = self.authorize(&notification.uri)?;
        tracing::info!(
            uri = %without_query(&notification.uri),
            correlation_id = %notification.correlation_id,
            "Downloading blob"
        );
        let bytes = self.transport.download_to(&url, dest, cancel).await?;
        tracing::debug!(bytes, dest = %dest.display(), "Blob downloaded");
        Ok(bytes)
    }
}

/// `uri` without query and fragment, safe to log
fn without_query(uri: &Url) -> String {
    let mut clean = uri.clone();
    clean.set_query(None);
    clean.set_fragment(None);
    clean.to_string()
}
