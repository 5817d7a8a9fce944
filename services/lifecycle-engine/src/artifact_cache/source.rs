//! Where artifact bytes come from.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::error::{EngineError, Result};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Parsed `artifact_uri`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Http(String),
    Local(PathBuf),
}

impl ArtifactLocation {
    /// `http(s)://` and `file://` map directly, bare strings are local paths,
    /// and `s3://bucket/key` goes through the configured gateway. Remote
    /// object-store references must carry their fingerprint.
    pub fn parse(uri: &str, s3_endpoint: Option<&str>, has_fingerprint: bool) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() { return Err(EngineError::bad_request("artifact_uri is empty")); }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(Self::Http(uri.to_string()));
        }
        if let Some(rest) = uri.strip_prefix("s3://") {
            if !has_fingerprint {
                return Err(EngineError::bad_request("remote artifact requires checkpoint_sha256 and checkpoint_size_bytes"));
            }
            let endpoint = s3_endpoint.map(|e| e.trim_end_matches('/')).filter(|e| !e.is_empty()).ok_or_else(|| {
                EngineError::bad_request("s3:// artifacts need cache.s3_endpoint configured")
            })?;
            if rest.is_empty() || !rest.contains('/') {
                return Err(EngineError::bad_request(format!("malformed s3 reference: {uri}")));
            }
            return Ok(Self::Http(format!("{endpoint}/{rest}")));
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Self::Local(PathBuf::from(path)));
        }
        if uri.contains("://") {
            return Err(EngineError::bad_request(format!("unsupported artifact_uri scheme for resolution: {uri}")));
        }
        Ok(Self::Local(PathBuf::from(uri)))
    }
}

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Open a byte stream for the artifact. Transport failures surface as
    /// `FetchFailed` with `retryable` set when another attempt could help.
    async fn open(&self, uri: &str, location: &ArtifactLocation) -> Result<ByteStream>;
}

/// HTTP via reqwest, local paths via tokio fs. Both stream; nothing is
/// buffered whole.
pub struct DefaultSource {
    client: reqwest::Client,
}

impl DefaultSource {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self { client: reqwest::Client::builder().connect_timeout(connect_timeout).build()? })
    }
}

fn fetch_failed(uri: &str, reason: impl std::fmt::Display, retryable: bool) -> EngineError {
    EngineError::FetchFailed { artifact_uri: uri.to_string(), reason: reason.to_string(), attempts: 1, retryable }
}

#[async_trait]
impl ArtifactSource for DefaultSource {
    async fn open(&self, uri: &str, location: &ArtifactLocation) -> Result<ByteStream> {
        match location {
            ArtifactLocation::Http(url) => {
                let resp = self.client.get(url).send().await.map_err(|e| fetch_failed(uri, e, true))?;
                let status = resp.status();
                if !status.is_success() {
                    let retryable = status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429;
                    return Err(fetch_failed(uri, format!("remote returned {status}"), retryable));
                }
                let owned = uri.to_string();
                Ok(resp.bytes_stream().map_err(move |e| fetch_failed(&owned, e, true)).boxed())
            }
            ArtifactLocation::Local(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    let retryable = e.kind() != std::io::ErrorKind::NotFound;
                    fetch_failed(uri, format!("{}: {e}", path.display()), retryable)
                })?;
                let owned = uri.to_string();
                Ok(ReaderStream::new(file).map_err(move |e| fetch_failed(&owned, e, true)).boxed())
            }
        }
    }
}
